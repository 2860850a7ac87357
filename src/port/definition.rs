//! Port definition exposed to the client

use crate::buffer::Direction;
use crate::utils::config::PortConfig;
use crate::utils::error::{CodecError, Result};
use serde::{Deserialize, Serialize};

/// How client buffers reach the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    /// Client memory is handed to the codec directly
    Share,

    /// Payload is copied through a pool of codec-owned blocks
    Copy,

    /// Copy mode that was forced by the codec rather than configured
    CopyForced,
}

impl ProcessType {
    /// True if the port needs an intermediate codec buffer pool
    pub fn uses_codec_pool(self) -> bool {
        matches!(self, ProcessType::Copy | ProcessType::CopyForced)
    }
}

/// Client-visible configuration and status of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub index: usize,
    pub direction: Direction,

    /// Number of buffers the client must register
    pub buffer_count: usize,

    /// Minimum size of each buffer
    pub buffer_size: usize,

    /// Whether the port takes part in processing
    pub enabled: bool,

    /// Whether every buffer slot is registered
    pub populated: bool,

    pub process_type: ProcessType,
    pub codec_buffer_count: usize,
    pub codec_buffer_size: usize,

    /// Connected directly to another component
    pub tunneled: bool,

    /// Supplies the buffers on a tunneled connection
    pub buffer_supplier: bool,
}

impl PortDefinition {
    pub fn from_config(direction: Direction, config: &PortConfig) -> Self {
        Self {
            index: direction.port_index(),
            direction,
            buffer_count: config.buffer_count,
            buffer_size: config.buffer_size,
            enabled: true,
            populated: false,
            process_type: config.process_type,
            codec_buffer_count: config.codec_buffer_count,
            codec_buffer_size: config.codec_buffer_size,
            tunneled: false,
            buffer_supplier: false,
        }
    }

    /// Check the values a client may change
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(CodecError::BadParameter("buffer_count must be non-zero".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(CodecError::BadParameter("buffer_size must be non-zero".to_string()));
        }
        if self.process_type.uses_codec_pool() && (self.codec_buffer_count == 0 || self.codec_buffer_size == 0) {
            return Err(CodecError::BadParameter(
                "Copy mode needs a non-empty codec buffer pool".to_string(),
            ));
        }
        if self.direction.port_index() != self.index {
            return Err(CodecError::BadParameter(format!(
                "port {} cannot have direction {}",
                self.index, self.direction
            )));
        }
        Ok(())
    }
}
