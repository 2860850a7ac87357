//! Codec driver abstraction for hwcodec
//!
//! The pipeline never talks to hardware directly. Everything codec-specific
//! sits behind the `CodecDriver` trait: one implementation per codec family,
//! selected when the component is built.

mod loopback;

pub use loopback::LoopbackDriver;

use crate::buffer::{BufferFlags, Direction, MemoryRef};
use crate::component::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Opaque per-frame tag the driver echoes back with the matching output.
///
/// Tags index the timestamp reordering table. A driver may return a tag it
/// never received; the table treats unknown tags as a recoverable fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u32);

impl Tag {
    /// Slot index this tag refers to
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Supported hardware codec families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    H264,
    Hevc,
    Mpeg4,
    H263,
    Mpeg2,
    Vp8,
    Vp9,
    Wmv,
}

impl CodecFamily {
    /// MIME type of the compressed stream
    pub fn mime_type(self) -> &'static str {
        match self {
            CodecFamily::H264 => "video/avc",
            CodecFamily::Hevc => "video/hevc",
            CodecFamily::Mpeg4 => "video/mp4v-es",
            CodecFamily::H263 => "video/3gpp",
            CodecFamily::Mpeg2 => "video/mpeg2",
            CodecFamily::Vp8 => "video/x-vnd.on2.vp8",
            CodecFamily::Vp9 => "video/x-vnd.on2.vp9",
            CodecFamily::Wmv => "video/x-ms-wmv",
        }
    }

    /// Whether the bitstream has B-frames, so output order differs from input order
    pub fn reorders_frames(self) -> bool {
        matches!(
            self,
            CodecFamily::H264 | CodecFamily::Hevc | CodecFamily::Mpeg4 | CodecFamily::Mpeg2 | CodecFamily::Wmv
        )
    }
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecFamily::H264 => "h264",
            CodecFamily::Hevc => "hevc",
            CodecFamily::Mpeg4 => "mpeg4",
            CodecFamily::H263 => "h263",
            CodecFamily::Mpeg2 => "mpeg2",
            CodecFamily::Vp8 => "vp8",
            CodecFamily::Vp9 => "vp9",
            CodecFamily::Wmv => "wmv",
        };
        f.write_str(name)
    }
}

/// Errors reported by a codec driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Codec cannot take more work yet; try again later
    #[error("codec not ready, retry later")]
    DecodeYet,

    /// Bitstream or frame is corrupted; skip it
    #[error("corrupted frame")]
    Corrupted,

    /// Codec ran out of internal resources
    #[error("codec out of resources: {0}")]
    InsufficientResources(String),

    /// Hardware reported a failure
    #[error("hardware failure: {0}")]
    Hardware(String),

    /// Codec could not be (re)initialized
    #[error("codec init failed: {0}")]
    InitFailed(String),

    /// Driver was shut down
    #[error("driver stopped")]
    Stopped,
}

/// What the pipeline does after a driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Keep the work and try again after a short wait
    Retry,

    /// Drop the offending frame and continue
    Skip,

    /// Report an error event and continue
    Escalate,

    /// Enter the Invalid state and stop the pipeline
    Fatal,
}

impl DriverError {
    /// Recovery policy for this error
    pub fn recovery(&self) -> Recovery {
        match self {
            DriverError::DecodeYet => Recovery::Retry,
            DriverError::Corrupted => Recovery::Skip,
            DriverError::InsufficientResources(_) | DriverError::Hardware(_) => Recovery::Escalate,
            DriverError::InitFailed(_) | DriverError::Stopped => Recovery::Fatal,
        }
    }

    /// Code reported in the client error event
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DriverError::DecodeYet => ErrorCode::NotReady,
            DriverError::Corrupted => ErrorCode::StreamCorrupt,
            DriverError::InsufficientResources(_) => ErrorCode::InsufficientResources,
            DriverError::Hardware(_) => ErrorCode::Hardware,
            DriverError::InitFailed(_) | DriverError::Stopped => ErrorCode::InvalidState,
        }
    }
}

/// Result type for driver calls
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A unit of compressed input handed to the codec
#[derive(Debug, Clone)]
pub struct InputFrame {
    /// Memory holding the payload
    pub buffer: MemoryRef,

    /// Start of the payload
    pub offset: usize,

    /// Payload length
    pub len: usize,

    /// Tag to echo back with the matching output
    pub tag: Option<Tag>,

    /// Presentation timestamp, informational only
    pub timestamp: i64,

    /// Input flags
    pub flags: BufferFlags,
}

/// A decoded frame produced by the codec
#[derive(Debug, Clone)]
pub struct OutputFrame {
    /// Output memory the codec wrote into
    pub buffer: MemoryRef,

    /// Bytes written
    pub len: usize,

    /// Tag of the input this frame came from
    pub tag: Option<Tag>,

    /// Output flags
    pub flags: BufferFlags,
}

/// New output layout announced by the codec mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFormat {
    /// Minimum size of each output buffer
    pub buffer_size: usize,

    /// Minimum number of output buffers
    pub buffer_count: usize,
}

/// Result of an output dequeue
#[derive(Debug, Clone)]
pub enum DriverOutput {
    /// A finished frame
    Frame(OutputFrame),

    /// Output memory handed back unused; queue it again
    Reuse(MemoryRef),

    /// Output memory holding a frame the codec flagged as broken
    Corrupted { buffer: MemoryRef, tag: Option<Tag> },

    /// Output buffers must be reallocated before decoding continues
    FormatChanged(PortFormat),
}

/// Hardware codec driver
///
/// Each method is called from exactly one pipeline stage: `submit_input` from
/// SrcIn, `dequeue_input` from SrcOut, `submit_output` from DstIn and
/// `dequeue_output` from DstOut. `stop` and `end_of_stream` may be called
/// from any thread.
pub trait CodecDriver: Send + Sync {
    /// Codec family this driver implements
    fn family(&self) -> CodecFamily;

    /// Queue compressed input
    ///
    /// # Arguments
    ///
    /// * `frame` - Input memory, payload range, tag and flags
    ///
    /// # Returns
    ///
    /// `DecodeYet` if the codec cannot accept more input right now
    fn submit_input(&self, frame: InputFrame) -> DriverResult<()>;

    /// Queue empty output memory for the codec to fill
    fn submit_output(&self, buffer: MemoryRef) -> DriverResult<()>;

    /// Retrieve input memory the codec has finished reading
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to block
    ///
    /// # Returns
    ///
    /// `None` if nothing was retired within the timeout
    fn dequeue_input(&self, timeout: Duration) -> DriverResult<Option<MemoryRef>>;

    /// Retrieve the next output event
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to block
    ///
    /// # Returns
    ///
    /// `None` if nothing happened within the timeout
    fn dequeue_output(&self, timeout: Duration) -> DriverResult<Option<DriverOutput>>;

    /// Abandon all work in one direction
    ///
    /// # Returns
    ///
    /// Every memory block the codec still held for that direction
    fn stop(&self, direction: Direction) -> DriverResult<Vec<MemoryRef>>;

    /// Signal that no more input will arrive
    fn end_of_stream(&self) -> DriverResult<()> {
        Ok(())
    }
}
