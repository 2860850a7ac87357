//! Stage thread bodies
//!
//! Each stage parks on its port's pause event while the component is not
//! Executing and on the enable event while the port is disabled or waiting
//! for a disable. Work is only moved while the stage holds the matching
//! DataBuffer lock, which is what lets a flush take a consistent snapshot.

use super::Stage;
use crate::buffer::{BufferFlags, BufferRef, DataBuffer, PipelineMessage};
use crate::codec::{DriverError, DriverOutput, InputFrame, Recovery};
use crate::component::{BypassFrame, ComponentShared, ComponentState, OutputDecision, PipelineCounters};
use crate::port::Port;
use crate::utils::error::{CodecError, Result};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(super) fn run(shared: Arc<ComponentShared>, stage: Stage) {
    let port = &shared.ports[stage.port_index()];
    debug!("{}: {} stage started", shared.id, stage);

    while !shared.exit_requested() {
        step(&shared, port, stage);
    }

    debug!("{}: {} stage exited", shared.id, stage);
}

/// One pass of a stage loop: park, or move one unit of work
fn step(shared: &ComponentShared, port: &Port, stage: Stage) {
    let max_wait = shared.config.pipeline.max_wait();

    let paused = port.pause_event.snapshot();
    if !is_processing(shared) && !port.is_flushing() {
        if !port.pause_event.wait_since(paused, max_wait) {
            trace!("{}: pause wait timed out", stage);
        }
        return;
    }

    let enabled = port.enable_event.snapshot();
    if !port.is_running() {
        if !port.enable_event.wait_since(enabled, max_wait) {
            trace!("{}: enable wait timed out", stage);
        }
        return;
    }

    let result = match stage {
        Stage::SrcIn => src_in(shared, port),
        Stage::SrcOut => src_out(shared, port),
        Stage::DstIn => dst_in(shared, port),
        Stage::DstOut => dst_out(shared, port),
    };
    match result {
        Err(err) => handle_error(shared, port, stage, err),
        // A flush outside Executing leaves nothing to move until it ends
        Ok(()) if !may_proceed(shared, port) => backoff(port, max_wait),
        Ok(()) => {}
    }
}

/// Executing, and not on the way out of it
fn is_processing(shared: &ComponentShared) -> bool {
    shared.state() == ComponentState::Executing
        && !matches!(shared.pending_transition(), Some(target) if target != ComponentState::Executing)
}

/// Re-checked after taking a DataBuffer lock, since a flush or state change
/// may have run while the stage was blocked on it
fn may_proceed(shared: &ComponentShared, port: &Port) -> bool {
    is_processing(shared) && port.is_running()
}

fn handle_error(shared: &ComponentShared, port: &Port, stage: Stage, err: CodecError) {
    let poll = shared.config.pipeline.poll_interval();
    match &err {
        CodecError::Driver(driver_err) => match driver_err.recovery() {
            Recovery::Retry => {
                trace!("{}: codec busy", stage);
                backoff(port, poll);
            }
            Recovery::Skip => {
                warn!("{}: skipped corrupted frame", stage);
                PipelineCounters::bump(&shared.stats.frames_corrupted);
            }
            Recovery::Escalate => {
                error!("{}: {}", stage, err);
                PipelineCounters::bump(&shared.stats.driver_errors);
                shared.emit_error(&err);
                backoff(port, shared.config.pipeline.max_wait());
            }
            Recovery::Fatal => {
                error!("{}: fatal codec error: {}", stage, err);
                PipelineCounters::bump(&shared.stats.driver_errors);
                shared.enter_invalid(&err.to_string());
            }
        },
        CodecError::TableFull | CodecError::QueueFull(_) => {
            trace!("{}: {}", stage, err);
            backoff(port, poll);
        }
        CodecError::Shutdown => {}
        _ => {
            error!("{}: {}", stage, err);
            shared.emit_error(&err);
            backoff(port, shared.config.pipeline.max_wait());
        }
    }
}

/// Bounded wait that ends early on any state change or flush
fn backoff(port: &Port, wait: Duration) {
    let seen = port.pause_event.snapshot();
    port.pause_event.wait_since(seen, wait);
}

/// Pop the next client buffer, discarding wake-up messages
fn take_buffer(port: &Port) -> Option<BufferRef> {
    match port.queue.take() {
        Some(PipelineMessage { buffer: Some(buffer), .. }) => Some(buffer),
        Some(_) => {
            trace!("{} port: discarding barrier", port.direction());
            None
        }
        None => None,
    }
}

/// Wait for a submitted buffer unless one is already staged
fn wait_for_submission(port: &Port, staged: bool, timeout: Duration) -> bool {
    staged || port.queue.wait(timeout) || !port.queue.is_empty()
}

fn src_in(shared: &ComponentShared, port: &Port) -> Result<()> {
    let config = &shared.config.pipeline;
    let staged = port.in_way.lock().valid;
    if !wait_for_submission(port, staged, config.max_wait()) {
        trace!("src-in: queue wait timed out");
        return Ok(());
    }

    let mut way = port.in_way.lock();
    if !may_proceed(shared, port) {
        return Ok(());
    }
    if !way.valid {
        match take_buffer(port) {
            Some(buffer) => way.load_client(buffer),
            None => return Ok(()),
        }
    }
    let Some(buffer) = way.buffer.clone() else {
        way.reset();
        return Ok(());
    };

    if finish_without_codec(shared, &mut way, &buffer) {
        return Ok(());
    }

    if port.process_type().uses_codec_pool() {
        feed_copied(shared, port, &mut way, &buffer)
    } else {
        feed_shared(shared, &mut way, &buffer)
    }
}

/// Handle input that never reaches the codec: empty payloads and EOS-only frames
fn finish_without_codec(shared: &ComponentShared, way: &mut DataBuffer, buffer: &BufferRef) -> bool {
    if way.remain_data_len > 0 {
        return false;
    }

    if way.flags.contains(BufferFlags::EOS) {
        let mark = shared.consume_mark(way.mark.take());
        shared.queue_eos_bypass(BypassFrame {
            timestamp: way.timestamp,
            flags: way.flags,
            mark,
            queued_at: Instant::now(),
        });
        if let Err(err) = shared.driver.end_of_stream() {
            warn!("src-in: end_of_stream failed: {}", err);
        }
    } else {
        shared.consume_mark(way.mark.take());
        trace!("src-in: returning empty input buffer {}", buffer.id());
    }

    way.reset();
    shared.return_unfilled(buffer);
    true
}

fn feed_shared(shared: &ComponentShared, way: &mut DataBuffer, buffer: &BufferRef) -> Result<()> {
    let mark = shared.consume_mark(way.mark.take());
    let tag = match shared.timestamps.lock().assign(way.timestamp, way.flags, mark) {
        Ok(tag) => tag,
        Err(err) => {
            way.mark = mark;
            return Err(err);
        }
    };

    let frame = InputFrame {
        buffer: buffer.memory().clone(),
        offset: way.read_position(),
        len: way.remain_data_len,
        tag: Some(tag),
        timestamp: way.timestamp,
        flags: way.flags,
    };

    match shared.driver.submit_input(frame) {
        Ok(()) => {
            trace!("src-in: buffer {} submitted with tag {}", buffer.id(), tag.0);
            PipelineCounters::bump(&shared.stats.frames_submitted);
            way.reset();
            Ok(())
        }
        Err(err) => {
            shared.timestamps.lock().release(tag);
            way.mark = mark;
            submit_failed(shared, way, buffer, err)
        }
    }
}

fn feed_copied(shared: &ComponentShared, port: &Port, way: &mut DataBuffer, buffer: &BufferRef) -> Result<()> {
    let Some(block) = port.codec_queue.pop_timeout(shared.config.pipeline.poll_interval()) else {
        trace!("src-in: no free codec buffer");
        return Ok(());
    };

    let chunk = way.remain_data_len.min(block.capacity());
    let copied = block.copy_from(buffer.memory(), way.read_position(), chunk);
    let last = copied == way.remain_data_len;
    let flags = if last { way.flags } else { way.flags - BufferFlags::EOS };
    let mark = if last { shared.consume_mark(way.mark.take()) } else { None };

    let tag = match shared.timestamps.lock().assign(way.timestamp, flags, mark) {
        Ok(tag) => tag,
        Err(err) => {
            if last {
                way.mark = mark;
            }
            port.recycle_codec_buffer(block);
            return Err(err);
        }
    };

    let frame = InputFrame {
        buffer: block.clone(),
        offset: 0,
        len: copied,
        tag: Some(tag),
        timestamp: way.timestamp,
        flags,
    };

    match shared.driver.submit_input(frame) {
        Ok(()) => {
            PipelineCounters::bump(&shared.stats.frames_submitted);
            way.consume(copied);
            if way.remain_data_len == 0 {
                trace!("src-in: buffer {} copied with tag {}", buffer.id(), tag.0);
                way.reset();
                shared.return_unfilled(buffer);
            }
            Ok(())
        }
        Err(err) => {
            shared.timestamps.lock().release(tag);
            port.recycle_codec_buffer(block);
            if last {
                way.mark = mark;
            }
            submit_failed(shared, way, buffer, err)
        }
    }
}

fn submit_failed(shared: &ComponentShared, way: &mut DataBuffer, buffer: &BufferRef, err: DriverError) -> Result<()> {
    match err.recovery() {
        Recovery::Retry => Err(err.into()),
        Recovery::Skip => {
            warn!("src-in: codec rejected buffer {} as corrupted", buffer.id());
            PipelineCounters::bump(&shared.stats.frames_corrupted);
            way.reset();
            shared.return_unfilled(buffer);
            Ok(())
        }
        Recovery::Escalate | Recovery::Fatal => {
            way.reset();
            shared.return_unfilled(buffer);
            Err(err.into())
        }
    }
}

fn src_out(shared: &ComponentShared, port: &Port) -> Result<()> {
    let _way = port.out_way.lock();
    if !may_proceed(shared, port) {
        return Ok(());
    }

    let Some(block) = shared.driver.dequeue_input(shared.config.pipeline.poll_interval())? else {
        return Ok(());
    };

    if port.process_type().uses_codec_pool() {
        port.recycle_codec_buffer(block);
        return Ok(());
    }

    match port.find_by_memory(block.id()) {
        Some(buffer) => {
            trace!("src-out: codec released buffer {}", buffer.id());
            shared.return_unfilled(&buffer);
        }
        None => warn!("src-out: codec released unknown memory {:?}", block.id()),
    }
    Ok(())
}

fn dst_in(shared: &ComponentShared, port: &Port) -> Result<()> {
    let config = &shared.config.pipeline;

    if port.process_type().uses_codec_pool() {
        if !port.codec_queue.wait(config.max_wait()) && port.codec_queue.is_empty() {
            return Ok(());
        }
        let _way = port.in_way.lock();
        if !may_proceed(shared, port) {
            return Ok(());
        }
        let Some(block) = port.codec_queue.take() else {
            return Ok(());
        };
        return match shared.driver.submit_output(block.clone()) {
            Ok(()) => Ok(()),
            Err(err) => {
                port.recycle_codec_buffer(block);
                Err(err.into())
            }
        };
    }

    let staged = port.in_way.lock().valid;
    if !wait_for_submission(port, staged, config.max_wait()) {
        trace!("dst-in: queue wait timed out");
        return Ok(());
    }

    let mut way = port.in_way.lock();
    if !may_proceed(shared, port) {
        return Ok(());
    }
    if !way.valid {
        match take_buffer(port) {
            Some(buffer) => way.load_client(buffer),
            None => return Ok(()),
        }
    }
    let Some(buffer) = way.buffer.clone() else {
        way.reset();
        return Ok(());
    };

    if shared.eos_bypass_ready() {
        // Serialize with dst-out so the EOS cannot overtake the last frame
        let _order = port.out_way.lock();
        if shared.eos_bypass_ready() && shared.emit_eos_bypass(&buffer) {
            way.reset();
            return Ok(());
        }
    }

    match shared.driver.submit_output(buffer.memory().clone()) {
        Ok(()) => {
            trace!("dst-in: output buffer {} queued to codec", buffer.id());
            way.reset();
            Ok(())
        }
        Err(err) if err.recovery() == Recovery::Retry => Err(err.into()),
        Err(err) => {
            way.reset();
            shared.return_unfilled(&buffer);
            Err(err.into())
        }
    }
}

fn dst_out(shared: &ComponentShared, port: &Port) -> Result<()> {
    if port.process_type().uses_codec_pool() {
        dst_out_copied(shared, port)
    } else {
        dst_out_shared(shared, port)
    }
}

/// Put a client output buffer back in line for the codec
fn requeue_output(shared: &ComponentShared, port: &Port, buffer: &BufferRef) {
    buffer.clear_payload();
    if let Err(err) = port.queue.push(PipelineMessage::fill_buffer(buffer.clone())) {
        warn!("dst-out: cannot requeue buffer {}: {}", buffer.id(), err);
        shared.return_unfilled(buffer);
    }
}

fn dst_out_shared(shared: &ComponentShared, port: &Port) -> Result<()> {
    let _way = port.out_way.lock();
    if !may_proceed(shared, port) {
        return Ok(());
    }

    let Some(output) = shared.driver.dequeue_output(shared.config.pipeline.poll_interval())? else {
        return Ok(());
    };

    match output {
        DriverOutput::Frame(frame) => {
            let Some(buffer) = port.find_by_memory(frame.buffer.id()) else {
                shared.timestamps.lock().retire(frame.tag);
                return Err(crate::internal_error!(
                    "codec filled unknown memory {:?}",
                    frame.buffer.id()
                ));
            };
            match shared.resolve_output(frame.tag, frame.flags) {
                OutputDecision::Deliver { timestamp, flags, mark } => {
                    buffer.set_output(frame.len, timestamp, flags, mark);
                    PipelineCounters::bump(&shared.stats.frames_delivered);
                    shared.deliver_output(&buffer);
                }
                OutputDecision::Drop => requeue_output(shared, port, &buffer),
            }
        }
        DriverOutput::Reuse(block) => match port.find_by_memory(block.id()) {
            Some(buffer) => requeue_output(shared, port, &buffer),
            None => warn!("dst-out: codec released unknown memory {:?}", block.id()),
        },
        DriverOutput::Corrupted { buffer: block, tag } => {
            warn!("dst-out: codec produced a corrupted frame for tag {:?}", tag);
            PipelineCounters::bump(&shared.stats.frames_corrupted);
            shared.timestamps.lock().retire(tag);
            if let Some(buffer) = port.find_by_memory(block.id()) {
                requeue_output(shared, port, &buffer);
            }
        }
        DriverOutput::FormatChanged(format) => shared.port_settings_changed(port, format),
    }
    Ok(())
}

fn dst_out_copied(shared: &ComponentShared, port: &Port) -> Result<()> {
    let poll = shared.config.pipeline.poll_interval();
    let mut way = port.out_way.lock();
    if !may_proceed(shared, port) {
        return Ok(());
    }

    if !way.valid {
        match shared.driver.dequeue_output(poll)? {
            None => return emit_pending_eos(shared, port, poll),
            Some(DriverOutput::Frame(frame)) => match shared.resolve_output(frame.tag, frame.flags) {
                OutputDecision::Deliver { timestamp, flags, mark } => {
                    way.load_codec(frame.buffer, frame.len, timestamp, flags, mark);
                }
                OutputDecision::Drop => {
                    port.recycle_codec_buffer(frame.buffer);
                    return Ok(());
                }
            },
            Some(DriverOutput::Reuse(block)) => {
                port.recycle_codec_buffer(block);
                return Ok(());
            }
            Some(DriverOutput::Corrupted { buffer, tag }) => {
                warn!("dst-out: codec produced a corrupted frame for tag {:?}", tag);
                PipelineCounters::bump(&shared.stats.frames_corrupted);
                shared.timestamps.lock().retire(tag);
                port.recycle_codec_buffer(buffer);
                return Ok(());
            }
            Some(DriverOutput::FormatChanged(format)) => {
                shared.port_settings_changed(port, format);
                return Ok(());
            }
        }
    }

    if !wait_for_submission(port, false, poll) {
        return Ok(());
    }
    let Some(buffer) = take_buffer(port) else {
        return Ok(());
    };
    let Some(block) = way.codec_buffer.take() else {
        way.reset();
        requeue_output(shared, port, &buffer);
        return Ok(());
    };

    let len = way.data_len.min(buffer.alloc_len());
    if len < way.data_len {
        warn!(
            "dst-out: frame of {} bytes truncated to buffer {} of {} bytes",
            way.data_len,
            buffer.id(),
            buffer.alloc_len()
        );
    }
    buffer.memory().copy_from(&block, 0, len);
    buffer.set_output(len, way.timestamp, way.flags, way.mark);
    way.reset();
    drop(way);

    port.recycle_codec_buffer(block);
    PipelineCounters::bump(&shared.stats.frames_delivered);
    shared.deliver_output(&buffer);
    Ok(())
}

/// Copy mode: complete a client buffer as the bypassed EOS once the codec is drained
fn emit_pending_eos(shared: &ComponentShared, port: &Port, poll: Duration) -> Result<()> {
    if !shared.eos_bypass_ready() || !wait_for_submission(port, false, poll) {
        return Ok(());
    }
    if let Some(buffer) = take_buffer(port) {
        if !shared.emit_eos_bypass(&buffer) {
            requeue_output(shared, port, &buffer);
        }
    }
    Ok(())
}
