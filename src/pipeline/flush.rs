//! Port flush coordination
//!
//! A flush holds both DataBuffer locks of the port, so no stage can be in the
//! middle of moving a buffer while the snapshot is taken. Everything the
//! component owns on the port (queued, staged, held by the codec) goes back
//! to the client unfilled.

use crate::buffer::BufferRef;
use crate::component::{CompletedCommand, ComponentEvent, ComponentShared, PipelineCounters};
use crate::port::{PortState, INPUT_PORT_INDEX};
use crate::utils::error::Result;
use log::{debug, info, trace, warn};

/// Flush one port and return how many buffers went back to the client.
///
/// # Arguments
///
/// * `raise_event` - Emit `CommandComplete(Flush)` when done
/// * `for_disable` - The flush is the first step of a port disable
pub(crate) fn flush_port(
    shared: &ComponentShared,
    index: usize,
    raise_event: bool,
    for_disable: bool,
) -> Result<usize> {
    let port = shared.port(index)?;
    let previous = port.state();
    info!("{}: flushing {} port", shared.id, port.direction());

    {
        // Submits that passed their state check finish before the state flips
        let _submission = port.submission.lock();
        port.set_state(if for_disable {
            PortState::FlushingForDisable
        } else {
            PortState::Flushing
        });
    }
    port.pause_event.signal();

    let mut in_way = port.in_way.lock();
    let mut out_way = port.out_way.lock();
    let uses_pool = port.process_type().uses_codec_pool();

    let mut returned = 0;
    let mut give_back = |buffer: &BufferRef| {
        if port.is_owned(buffer) {
            shared.return_unfilled(buffer);
            returned += 1;
        }
    };

    for message in port.queue.drain() {
        match message.buffer {
            Some(buffer) => give_back(&buffer),
            None => trace!("{} port: discarding barrier", port.direction()),
        }
    }

    for way in [&mut *in_way, &mut *out_way] {
        if way.valid {
            if let Some(buffer) = way.buffer.take() {
                give_back(&buffer);
            }
        }
        way.reset();
    }

    match shared.driver.stop(port.direction()) {
        Ok(held) => {
            debug!("{} port: codec released {} buffers", port.direction(), held.len());
            if !uses_pool {
                for block in held {
                    if let Some(buffer) = port.find_by_memory(block.id()) {
                        give_back(&buffer);
                    }
                }
            }
        }
        Err(err) => warn!("{}: codec stop failed during flush: {}", shared.id, err),
    }

    port.queue.reset();
    for buffer in port.owned_buffers() {
        give_back(&buffer);
    }

    if uses_pool {
        port.refill_codec_queue();
    }

    if index == INPUT_PORT_INDEX {
        shared.timestamps.lock().clear();
        shared.clear_eos_bypass();
    } else {
        shared.timestamps.lock().reset_output_order();
    }

    drop(out_way);
    drop(in_way);

    port.set_state(if previous.is_flushing() {
        shared.port_state()
    } else {
        previous
    });
    PipelineCounters::bump(&shared.stats.flushes);
    info!("{}: {} port flushed, {} buffers returned", shared.id, port.direction(), returned);

    if raise_event {
        shared.emit(ComponentEvent::CommandComplete(CompletedCommand::Flush(index)));
    }
    Ok(returned)
}
