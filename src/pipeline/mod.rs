//! Four-stage buffer pipeline
//!
//! One thread per stage:
//! - SrcIn feeds client input to the codec
//! - SrcOut returns input the codec has finished with
//! - DstIn hands empty output memory to the codec
//! - DstOut delivers decoded frames to the client
//!
//! Every blocking point is bounded by `max_wait`, and `stop` wakes them all
//! in a fixed order before joining.

mod flush;
mod stage;
mod timestamp;

pub use timestamp::{Retrieved, TimestampTable};

pub(crate) use flush::flush_port;

use crate::component::ComponentShared;
use crate::utils::error::{IntoCodecError, Result};
use log::{debug, error, info};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SrcIn,
    SrcOut,
    DstIn,
    DstOut,
}

impl Stage {
    /// Wake and join order
    pub const ALL: [Stage; 4] = [Stage::SrcIn, Stage::DstIn, Stage::SrcOut, Stage::DstOut];

    /// Port whose buffers this stage moves
    pub fn port_index(self) -> usize {
        match self {
            Stage::SrcIn | Stage::SrcOut => crate::port::INPUT_PORT_INDEX,
            Stage::DstIn | Stage::DstOut => crate::port::OUTPUT_PORT_INDEX,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::SrcIn => "src-in",
            Stage::SrcOut => "src-out",
            Stage::DstIn => "dst-in",
            Stage::DstOut => "dst-out",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Join handles of the running stage threads
#[derive(Default)]
pub(crate) struct PipelineThreads {
    handles: Vec<(Stage, JoinHandle<()>)>,
}

impl PipelineThreads {
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }
}

/// Spawn the four stage threads
pub(crate) fn start(shared: &Arc<ComponentShared>) -> Result<()> {
    let mut threads = shared.pipeline.lock();
    if threads.is_running() {
        debug!("{}: pipeline already running", shared.id);
        return Ok(());
    }

    shared.clear_exit();
    for stage in Stage::ALL {
        let context = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("hwcodec-{}", stage))
            .spawn(move || stage::run(context, stage))
            .internal_err("Failed to spawn pipeline thread")?;
        threads.handles.push((stage, handle));
    }

    info!("{}: pipeline started", shared.id);
    Ok(())
}

/// Stop and join the stage threads
pub(crate) fn stop(shared: &ComponentShared) {
    let handles = std::mem::take(&mut shared.pipeline.lock().handles);
    shared.request_exit();
    wake_all(shared);

    if handles.is_empty() {
        return;
    }

    for (stage, handle) in handles {
        if handle.join().is_err() {
            error!("{}: {} thread panicked", shared.id, stage);
        }
    }
    for port in &shared.ports {
        port.queue.purge_barriers();
    }
    info!("{}: pipeline stopped", shared.id);
}

/// Force every wait point of every stage to return
pub(crate) fn wake_all(shared: &ComponentShared) {
    for stage in Stage::ALL {
        let port = &shared.ports[stage.port_index()];
        port.pause_event.signal();
        port.enable_event.signal();
        match stage {
            Stage::SrcIn => port.queue.push_barrier(),
            Stage::DstIn => {
                if port.process_type().uses_codec_pool() {
                    port.codec_queue.wake();
                } else {
                    port.queue.push_barrier();
                }
            }
            Stage::SrcOut => port.codec_queue.wake(),
            Stage::DstOut => {
                if port.process_type().uses_codec_pool() {
                    port.queue.push_barrier();
                }
            }
        }
    }
}
