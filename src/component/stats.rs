//! Pipeline statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the pipeline threads
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub frames_submitted: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_corrupted: AtomicU64,
    pub input_returned: AtomicU64,
    pub output_returned: AtomicU64,
    pub timestamp_warnings: AtomicU64,
    pub protocol_rejections: AtomicU64,
    pub driver_errors: AtomicU64,
    pub eos_bypassed: AtomicU64,
    pub flushes: AtomicU64,
}

impl PipelineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            frames_submitted: load(&self.frames_submitted),
            frames_delivered: load(&self.frames_delivered),
            frames_dropped: load(&self.frames_dropped),
            frames_corrupted: load(&self.frames_corrupted),
            input_returned: load(&self.input_returned),
            output_returned: load(&self.output_returned),
            timestamp_warnings: load(&self.timestamp_warnings),
            protocol_rejections: load(&self.protocol_rejections),
            driver_errors: load(&self.driver_errors),
            eos_bypassed: load(&self.eos_bypassed),
            flushes: load(&self.flushes),
        }
    }
}

/// Snapshot of the pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Input frames accepted by the codec
    pub frames_submitted: u64,

    /// Output frames handed to the client
    pub frames_delivered: u64,

    /// Output frames dropped before the start timestamp
    pub frames_dropped: u64,

    /// Frames skipped because the codec flagged them corrupted
    pub frames_corrupted: u64,

    /// Input buffers returned to the client
    pub input_returned: u64,

    /// Output buffers returned to the client
    pub output_returned: u64,

    /// Tag fallbacks and timestamp clamps
    pub timestamp_warnings: u64,

    /// Double submits and returns without ownership
    pub protocol_rejections: u64,

    /// Driver errors reported to the client
    pub driver_errors: u64,

    /// End-of-stream frames that bypassed the codec
    pub eos_bypassed: u64,

    /// Completed port flushes
    pub flushes: u64,
}

impl PipelineStats {
    /// Total buffers returned on both ports
    pub fn buffers_returned(&self) -> u64 {
        self.input_returned + self.output_returned
    }
}
