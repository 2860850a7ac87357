//! Software loopback codec
//!
//! Copies every input payload into the next free output buffer. With a
//! non-zero reorder depth it holds that many frames back and releases them
//! in timestamp order, which is how a decoder for a stream with B-frames
//! behaves.

use super::{
    CodecDriver, CodecFamily, DriverError, DriverOutput, DriverResult, InputFrame, OutputFrame,
    PortFormat, Tag,
};
use crate::buffer::{BufferFlags, Direction, MemoryRef};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

struct PendingFrame {
    data: Vec<u8>,
    tag: Option<Tag>,
    timestamp: i64,
    flags: BufferFlags,
}

#[derive(Default)]
struct LoopbackState {
    pending: Vec<PendingFrame>,
    free_outputs: VecDeque<MemoryRef>,
    draining: bool,
    eos_pending: bool,
    frames_in: u64,
    frames_out: u64,
}

/// In-process codec that echoes input to output
pub struct LoopbackDriver {
    family: CodecFamily,
    max_in_flight: usize,
    reorder_depth: usize,
    state: Mutex<LoopbackState>,
    retired_tx: Sender<MemoryRef>,
    retired_rx: Receiver<MemoryRef>,
    output_tx: Sender<DriverOutput>,
    output_rx: Receiver<DriverOutput>,
}

impl LoopbackDriver {
    /// Loopback for `family` that accepts up to `max_in_flight` undecoded frames
    pub fn new(family: CodecFamily, max_in_flight: usize) -> Self {
        let (retired_tx, retired_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();
        Self {
            family,
            max_in_flight: max_in_flight.max(1),
            reorder_depth: 0,
            state: Mutex::new(LoopbackState::default()),
            retired_tx,
            retired_rx,
            output_tx,
            output_rx,
        }
    }

    /// Hold `depth` frames back and emit them in timestamp order
    pub fn with_reorder_depth(mut self, depth: usize) -> Self {
        self.reorder_depth = depth;
        self.max_in_flight = self.max_in_flight.max(depth + 1);
        self
    }

    /// Announce a new output layout on the next output dequeue
    pub fn announce_format(&self, format: PortFormat) {
        debug!(
            "Loopback announcing output format {} x {} bytes",
            format.buffer_count, format.buffer_size
        );
        let _ = self.output_tx.send(DriverOutput::FormatChanged(format));
    }

    /// Frames accepted but not yet emitted
    pub fn pending_frames(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total frames accepted and emitted
    pub fn frame_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.frames_in, state.frames_out)
    }

    fn pump(&self, state: &mut LoopbackState) {
        loop {
            let ready = state.pending.len() > self.reorder_depth
                || (state.draining && !state.pending.is_empty());
            if !ready || state.free_outputs.is_empty() {
                break;
            }

            let next = state
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, frame)| frame.timestamp)
                .map(|(index, _)| index);
            let (Some(index), Some(output)) = (next, state.free_outputs.pop_front()) else {
                break;
            };
            let frame = state.pending.remove(index);

            let mut flags = frame.flags - BufferFlags::EOS;
            if state.pending.is_empty() && state.eos_pending {
                flags |= BufferFlags::EOS;
                state.eos_pending = false;
            }

            let len = output.write_at(0, &frame.data);
            trace!("Loopback emitting tag {:?} ({} bytes)", frame.tag, len);
            state.frames_out += 1;
            let _ = self.output_tx.send(DriverOutput::Frame(OutputFrame {
                buffer: output,
                len,
                tag: frame.tag,
                flags,
            }));
        }

        if state.draining && state.pending.is_empty() {
            state.draining = false;
        }
    }
}

impl CodecDriver for LoopbackDriver {
    fn family(&self) -> CodecFamily {
        self.family
    }

    fn submit_input(&self, frame: InputFrame) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.pending.len() >= self.max_in_flight {
            return Err(DriverError::DecodeYet);
        }

        let data = frame.buffer.read_range(frame.offset, frame.len);
        if frame.flags.contains(BufferFlags::EOS) {
            state.draining = true;
            state.eos_pending = true;
        }
        state.pending.push(PendingFrame {
            data,
            tag: frame.tag,
            timestamp: frame.timestamp,
            flags: frame.flags,
        });
        state.frames_in += 1;

        let _ = self.retired_tx.send(frame.buffer);
        self.pump(&mut state);
        Ok(())
    }

    fn submit_output(&self, buffer: MemoryRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.free_outputs.push_back(buffer);
        self.pump(&mut state);
        Ok(())
    }

    fn dequeue_input(&self, timeout: Duration) -> DriverResult<Option<MemoryRef>> {
        match self.retired_rx.recv_timeout(timeout) {
            Ok(buffer) => Ok(Some(buffer)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::Stopped),
        }
    }

    fn dequeue_output(&self, timeout: Duration) -> DriverResult<Option<DriverOutput>> {
        match self.output_rx.recv_timeout(timeout) {
            Ok(output) => Ok(Some(output)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::Stopped),
        }
    }

    fn stop(&self, direction: Direction) -> DriverResult<Vec<MemoryRef>> {
        let mut state = self.state.lock();
        let held: Vec<MemoryRef> = match direction {
            Direction::Input => {
                state.pending.clear();
                state.draining = false;
                state.eos_pending = false;
                self.retired_rx.try_iter().collect()
            }
            Direction::Output => {
                let mut held: Vec<MemoryRef> = state.free_outputs.drain(..).collect();
                held.extend(self.output_rx.try_iter().filter_map(|output| match output {
                    DriverOutput::Frame(frame) => Some(frame.buffer),
                    DriverOutput::Reuse(buffer) => Some(buffer),
                    DriverOutput::Corrupted { buffer, .. } => Some(buffer),
                    DriverOutput::FormatChanged(_) => None,
                }));
                held
            }
        };
        debug!("Loopback stopped {} side, released {} blocks", direction, held.len());
        Ok(held)
    }

    fn end_of_stream(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.draining = true;
        self.pump(&mut state);
        Ok(())
    }
}
