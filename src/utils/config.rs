//! Configuration management for hwcodec
//!
//! This module handles loading and managing component configuration from
//! config files and environment variables.

use crate::codec::CodecFamily;
use crate::port::ProcessType;
use crate::utils::error::{CodecError, IntoCodecError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main component configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline timing and codec selection
    pub pipeline: PipelineConfig,

    /// Input port buffer layout
    pub input_port: PortConfig,

    /// Output port buffer layout
    pub output_port: PortConfig,

    /// General settings
    pub general: GeneralConfig,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hardware codec family driven by this component
    pub codec_family: CodecFamily,

    /// Upper bound on any single blocking wait, in milliseconds
    pub max_wait_ms: u64,

    /// Timeout handed to driver dequeue calls, in milliseconds
    pub poll_interval_ms: u64,

    /// How long a bypassed end-of-stream frame may wait for in-flight frames
    pub eos_drain_timeout_ms: u64,

    /// How long enable/disable/state rendezvous wait before failing
    pub rendezvous_timeout_ms: u64,

    /// Number of timestamp reordering slots
    pub timestamp_slots: usize,
}

/// Per-port buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Number of client buffers the port expects
    pub buffer_count: usize,

    /// Size of each client buffer in bytes
    pub buffer_size: usize,

    /// Whether client buffers go to the codec directly or through a copy
    pub process_type: ProcessType,

    /// Number of intermediate codec buffers in Copy mode
    pub codec_buffer_count: usize,

    /// Size of each intermediate codec buffer in bytes
    pub codec_buffer_size: usize,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            codec_family: CodecFamily::H264,
            max_wait_ms: 100,
            poll_interval_ms: 5,
            eos_drain_timeout_ms: 500,
            rendezvous_timeout_ms: 5000,
            timestamp_slots: 32,
        }
    }
}

impl PipelineConfig {
    /// Bounded wait used at every stage suspension point
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Driver dequeue timeout
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// End-of-stream drain deadline
    pub fn eos_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.eos_drain_timeout_ms)
    }

    /// Rendezvous deadline
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            buffer_size: 64 * 1024,
            process_type: ProcessType::Share,
            codec_buffer_count: 4,
            codec_buffer_size: 64 * 1024,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/hwcodec/config.toml)
    /// 3. User config file (~/.config/hwcodec/config.toml)
    /// 4. Environment variables (HWCODEC_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config.merge_from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config.merge_from_file(&user_path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load a single file on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.merge_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).config_err("Failed to create config directory")?;
        }

        let toml = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(path, toml).config_err("Failed to write config file")?;

        Ok(())
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| CodecError::Config("Cannot determine user config path".to_string()))?;
        self.save_to(&path)
    }

    /// Merge configuration from a TOML file.
    ///
    /// Sections and keys missing from the file keep their current defaults.
    fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).config_err("Failed to read config file")?;
        let file_config: Config = toml::from_str(&contents).config_err("Failed to parse config file")?;
        *self = file_config;
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("HWCODEC_MAX_WAIT_MS") {
            self.pipeline.max_wait_ms = value
                .parse()
                .map_err(|_| CodecError::Config("Invalid HWCODEC_MAX_WAIT_MS".to_string()))?;
        }

        if let Ok(value) = std::env::var("HWCODEC_POLL_INTERVAL_MS") {
            self.pipeline.poll_interval_ms = value
                .parse()
                .map_err(|_| CodecError::Config("Invalid HWCODEC_POLL_INTERVAL_MS".to_string()))?;
        }

        if let Ok(value) = std::env::var("HWCODEC_INPUT_BUFFERS") {
            self.input_port.buffer_count = value
                .parse()
                .map_err(|_| CodecError::Config("Invalid HWCODEC_INPUT_BUFFERS".to_string()))?;
        }

        if let Ok(value) = std::env::var("HWCODEC_OUTPUT_BUFFERS") {
            self.output_port.buffer_count = value
                .parse()
                .map_err(|_| CodecError::Config("Invalid HWCODEC_OUTPUT_BUFFERS".to_string()))?;
        }

        if let Ok(log_level) = std::env::var("HWCODEC_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_wait_ms == 0 {
            return Err(CodecError::Config("max_wait_ms must be non-zero".to_string()));
        }

        if self.pipeline.poll_interval_ms == 0 || self.pipeline.poll_interval_ms > self.pipeline.max_wait_ms {
            return Err(CodecError::Config(
                "poll_interval_ms must be non-zero and not exceed max_wait_ms".to_string(),
            ));
        }

        if !(2..=256).contains(&self.pipeline.timestamp_slots) {
            return Err(CodecError::Config(format!(
                "timestamp_slots must be between 2 and 256, got {}",
                self.pipeline.timestamp_slots
            )));
        }

        for (name, port) in [("input_port", &self.input_port), ("output_port", &self.output_port)] {
            if port.buffer_count == 0 || port.buffer_size == 0 {
                return Err(CodecError::Config(format!(
                    "{} buffer_count and buffer_size must be non-zero",
                    name
                )));
            }
            if port.process_type.uses_codec_pool()
                && (port.codec_buffer_count == 0 || port.codec_buffer_size == 0)
            {
                return Err(CodecError::Config(format!(
                    "{} needs a non-empty codec buffer pool in {:?} mode",
                    name, port.process_type
                )));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(CodecError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        return Some(PathBuf::from("/etc/hwcodec/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hwcodec").join("config.toml"))
    }
}
