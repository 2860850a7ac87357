//! Codec component: the client-facing state machine
//!
//! A `Component` owns two ports, a codec driver and the four pipeline
//! threads that move buffers between them. Clients talk to it through
//! synchronous calls (buffer submission, registration) and asynchronous
//! commands whose completion arrives through `ComponentCallbacks`.

mod builder;
mod command;
mod handle;
mod shared;
mod stats;

pub use builder::ComponentBuilder;
pub use handle::Component;
pub use stats::PipelineStats;

pub(crate) use shared::{BypassFrame, ComponentShared, OutputDecision};
pub(crate) use stats::PipelineCounters;

use crate::buffer::{BufferFlags, BufferMark, BufferRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique component identity, used as the target of buffer marks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub u64);

impl ComponentId {
    pub(crate) fn next() -> Self {
        ComponentId(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component-{}", self.0)
    }
}

/// Component life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Created, no buffers, pipeline not running
    Loaded,

    /// Buffers registered, pipeline threads parked
    Idle,

    /// Processing
    Executing,

    /// Processing suspended, buffers kept
    Pause,

    /// Waiting for the platform to grant resources
    WaitForResources,

    /// Unrecoverable failure; only destruction is allowed
    Invalid,
}

impl ComponentState {
    /// Whether `StateSet(target)` is legal from this state
    pub fn can_transition_to(self, target: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, target),
            (Loaded, Idle)
                | (Loaded, WaitForResources)
                | (WaitForResources, Loaded)
                | (WaitForResources, Idle)
                | (Idle, Loaded)
                | (Idle, Executing)
                | (Idle, Pause)
                | (Executing, Idle)
                | (Executing, Pause)
                | (Pause, Idle)
                | (Pause, Executing)
                | (_, Invalid)
        )
    }

    /// True in the states where buffers circulate
    pub fn accepts_buffers(self) -> bool {
        matches!(self, ComponentState::Idle | ComponentState::Executing | ComponentState::Pause)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Port selector used by port commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSelector {
    /// A single port by index
    Port(usize),

    /// Every port
    All,
}

impl PortSelector {
    /// Port indices addressed by this selector
    pub fn indices(self) -> Vec<usize> {
        match self {
            PortSelector::Port(index) => vec![index],
            PortSelector::All => (0..crate::port::PORT_COUNT).collect(),
        }
    }
}

/// Asynchronous command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Move the component to another state
    StateSet(ComponentState),

    /// Return every buffer held on the selected ports
    Flush(PortSelector),

    /// Take the selected ports out of processing
    PortDisable(PortSelector),

    /// Bring the selected ports back into processing
    PortEnable(PortSelector),

    /// Attach a mark to the next buffer submitted on an input port
    MarkBuffer { port: usize, mark: BufferMark },
}

/// Completed command, as reported in `ComponentEvent::CommandComplete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedCommand {
    StateSet(ComponentState),
    Flush(usize),
    PortDisable(usize),
    PortEnable(usize),
    MarkBuffer(usize),
}

/// Error codes reported through `ComponentEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Undefined,
    BadParameter,
    BadPortIndex,
    InsufficientResources,
    IncorrectStateTransition,
    IncorrectStateOperation,
    SameState,
    InvalidState,
    NotReady,
    Timeout,
    StreamCorrupt,
    Hardware,
    PortUnpopulated,
}

/// Notification delivered to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentEvent {
    /// An asynchronous command finished
    CommandComplete(CompletedCommand),

    /// The output layout changed; disable and re-enable the port
    PortSettingsChanged { port: usize },

    /// A buffer carrying notable flags (EOS) left the component
    BufferFlag { port: usize, flags: BufferFlags },

    /// A mark targeting this component was reached
    Mark { data: u64 },

    /// Something failed
    Error(ErrorCode),
}

/// Client callback interface
///
/// Called from the command thread and the pipeline threads. Implementations
/// must not call `Component::flush`, `enable_port` or `disable_port` from
/// inside a callback; submitting buffers and sending commands is fine.
pub trait ComponentCallbacks: Send + Sync {
    /// Handle an event
    fn event(&self, event: ComponentEvent);

    /// An input buffer was consumed and belongs to the client again
    fn empty_buffer_done(&self, buffer: BufferRef);

    /// An output buffer was filled and belongs to the client again
    fn fill_buffer_done(&self, buffer: BufferRef);
}
