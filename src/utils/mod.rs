//! Utility module for hwcodec
//!
//! This module provides common utilities used throughout the crate:
//! - Error handling with custom error types
//! - Configuration management
//! - Blocking wait primitives

pub mod config;
pub mod error;
pub mod signal;

// Re-export commonly used items
pub use config::{Config, GeneralConfig, PipelineConfig, PortConfig};
pub use error::{CodecError, Result};
pub use signal::{Event, Semaphore};

/// Initialize the component configuration
///
/// Loads configuration from:
/// 1. Default values
/// 2. System configuration file
/// 3. User configuration file
/// 4. Environment variables
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Format a microsecond timestamp for logs as "SS.mmm" or "MM:SS.mmm"
pub fn format_timestamp(timestamp_us: i64) -> String {
    let sign = if timestamp_us < 0 { "-" } else { "" };
    let abs = timestamp_us.unsigned_abs();
    let millis = (abs / 1_000) % 1_000;
    let total_secs = abs / 1_000_000;
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;

    if minutes > 0 {
        format!("{}{:02}:{:02}.{:03}", sign, minutes, seconds, millis)
    } else {
        format!("{}{:02}.{:03}", sign, seconds, millis)
    }
}
