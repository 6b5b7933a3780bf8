//! Stream configuration
//!
//! Library defaults with `GVS_STREAM_*` environment overrides, in the same
//! builder style as the scheduler config.

use std::time::Duration;

use crate::env::{env_get, env_get_ms};

pub mod defaults {
    /// Items a downstream manager may hold before reporting zero capacity
    pub const MAX_BUFFER: usize = 128;
    /// Preferred batch size for a freshly created path
    pub const BATCH_SIZE: usize = 16;
    /// Underfull batches are forced out after this delay
    pub const MAX_BATCH_DELAY_MS: u64 = 50;
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Central buffer size per downstream manager
    pub max_buffer: usize,
    /// Desired batch size for new paths
    pub batch_size: usize,
    /// Maximum delay before `tick` forces underfull batches
    pub max_batch_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl StreamConfig {
    /// Defaults overridden by the environment:
    /// - `GVS_STREAM_MAX_BUFFER`
    /// - `GVS_STREAM_BATCH_SIZE`
    /// - `GVS_STREAM_MAX_BATCH_DELAY_MS`
    pub fn from_env() -> Self {
        Self {
            max_buffer: env_get("GVS_STREAM_MAX_BUFFER", defaults::MAX_BUFFER),
            batch_size: env_get("GVS_STREAM_BATCH_SIZE", defaults::BATCH_SIZE),
            max_batch_delay: env_get_ms(
                "GVS_STREAM_MAX_BATCH_DELAY_MS",
                defaults::MAX_BATCH_DELAY_MS,
            ),
        }
    }

    /// Library defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            max_buffer: defaults::MAX_BUFFER,
            batch_size: defaults::BATCH_SIZE,
            max_batch_delay: Duration::from_millis(defaults::MAX_BATCH_DELAY_MS),
        }
    }

    pub fn max_buffer(mut self, n: usize) -> Self {
        self.max_buffer = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn max_batch_delay(mut self, d: Duration) -> Self {
        self.max_batch_delay = d;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1");
        }
        if self.max_buffer < self.batch_size {
            return Err("max_buffer must hold at least one batch");
        }
        Ok(())
    }
}
