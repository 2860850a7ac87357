//! Error types for hwcodec
//!
//! This module defines the error taxonomy shared by the port state machine,
//! the ownership protocol and the pipeline stages. We use thiserror for the
//! error enum and leave anyhow to the binary.

use crate::component::ErrorCode;
use thiserror::Error;

/// Main error type for hwcodec
#[derive(Error, Debug)]
pub enum CodecError {
    /// Port index out of range
    #[error("Invalid port index: {0}")]
    InvalidPort(usize),

    /// Operation not allowed in the current component or port state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Buffer handle does not belong to this component or port
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Parameter value rejected
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Buffer submitted while the component already owns it
    #[error("Buffer {0} is already owned by the component")]
    AlreadyOwned(u32),

    /// Buffer returned or freed while the component does not own it
    #[error("Buffer {0} is not owned by the component")]
    NotOwned(u32),

    /// Allocation or bookkeeping capacity exhausted
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Port queue has no room for another message
    #[error("Port queue full (capacity {0})")]
    QueueFull(usize),

    /// Every timestamp slot is live
    #[error("Timestamp table full")]
    TableFull,

    /// Codec driver failure
    #[error("Driver error: {0}")]
    Driver(#[from] crate::codec::DriverError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// A rendezvous did not complete in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Operation aborted because the pipeline is shutting down
    #[error("Pipeline is shutting down")]
    Shutdown,

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CodecError {
    /// Create an invalid state error from string
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        CodecError::InvalidState(msg.into())
    }

    /// True for errors that are rejected before any state is touched
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidPort(_)
                | CodecError::InvalidState(_)
                | CodecError::InvalidBuffer(_)
                | CodecError::BadParameter(_)
        )
    }

    /// True for ownership protocol violations
    pub fn is_protocol(&self) -> bool {
        matches!(self, CodecError::AlreadyOwned(_) | CodecError::NotOwned(_))
    }

    /// Map to the code carried by client error events
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CodecError::InvalidPort(_) => ErrorCode::BadPortIndex,
            CodecError::InvalidState(_) => ErrorCode::IncorrectStateOperation,
            CodecError::InvalidBuffer(_) | CodecError::BadParameter(_) => ErrorCode::BadParameter,
            CodecError::AlreadyOwned(_) | CodecError::NotOwned(_) => ErrorCode::BadParameter,
            CodecError::InsufficientResources(_)
            | CodecError::QueueFull(_)
            | CodecError::TableFull => ErrorCode::InsufficientResources,
            CodecError::Driver(e) => e.error_code(),
            CodecError::Timeout(_) => ErrorCode::Timeout,
            CodecError::Config(_)
            | CodecError::FileIO(_)
            | CodecError::Shutdown
            | CodecError::Internal(_) => ErrorCode::Undefined,
        }
    }
}

/// Convenience type alias for Results in hwcodec
pub type Result<T> = std::result::Result<T, CodecError>;

/// Extension trait for converting other errors to CodecError
pub trait IntoCodecError<T> {
    /// Convert this error into a CodecError with the given context
    fn config_err(self, context: &str) -> Result<T>;
    fn resource_err(self, context: &str) -> Result<T>;
    fn internal_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoCodecError<T> for std::result::Result<T, E> {
    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CodecError::Config(format!("{}: {}", context, e)))
    }

    fn resource_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CodecError::InsufficientResources(format!("{}: {}", context, e)))
    }

    fn internal_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CodecError::Internal(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::CodecError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::CodecError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
