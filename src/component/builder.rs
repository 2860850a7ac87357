//! Component builder

use super::{Component, ComponentCallbacks};
use crate::buffer::{Allocator, HeapAllocator};
use crate::codec::{CodecDriver, LoopbackDriver};
use crate::utils::config::Config;
use crate::utils::error::{CodecError, Result};
use log::warn;
use std::sync::Arc;

/// Builder for `Component`
pub struct ComponentBuilder {
    config: Config,
    driver: Option<Arc<dyn CodecDriver>>,
    allocator: Option<Arc<dyn Allocator>>,
    callbacks: Option<Arc<dyn ComponentCallbacks>>,
}

impl ComponentBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            driver: None,
            allocator: None,
            callbacks: None,
        }
    }

    /// Set component configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the codec driver. Without one the component runs a
    /// `LoopbackDriver` for the configured codec family.
    pub fn with_driver(mut self, driver: Arc<dyn CodecDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the memory allocator (default: `HeapAllocator`)
    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Set the client callbacks
    pub fn with_callbacks(mut self, callbacks: Arc<dyn ComponentCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Build the component
    pub fn build(self) -> Result<Component> {
        let callbacks = self
            .callbacks
            .ok_or_else(|| CodecError::BadParameter("component callbacks are required".to_string()))?;

        let family = self.config.pipeline.codec_family;
        let driver = self.driver.unwrap_or_else(|| {
            Arc::new(LoopbackDriver::new(family, self.config.input_port.buffer_count))
        });
        if driver.family() != family {
            warn!("Driver decodes {} but the configuration names {}", driver.family(), family);
        }

        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(HeapAllocator::new()));

        Component::new(self.config, driver, allocator, callbacks)
    }
}

impl Default for ComponentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
