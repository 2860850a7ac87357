//! hwcodec - buffer pipeline and port state machine for hardware video codec components
//!
//! A [`Component`] exposes one input and one output port to its client.
//! Buffers are registered once and then passed back and forth under an
//! explicit ownership protocol, while four pipeline threads move payloads
//! between the client and a [`CodecDriver`].

pub mod buffer;
pub mod codec;
pub mod component;
pub mod pipeline;
pub mod port;
pub mod utils;

pub use buffer::{BufferFlags, BufferMark, BufferRef, Direction, HeapAllocator};
pub use codec::{CodecDriver, CodecFamily, LoopbackDriver};
pub use component::{
    Command, Component, ComponentBuilder, ComponentCallbacks, ComponentEvent, ComponentState,
    ErrorCode, PipelineStats, PortSelector,
};
pub use port::{PortDefinition, ProcessType};
pub use utils::{CodecError, Config, Result};
