//! Reactor configuration
//!
//! `GVS_MUX_*` environment overrides on top of library defaults.

use gvstream_core::env::env_get;

pub mod defaults {
    /// Resumables popped per critical section in `flush_runnables`
    pub const FLUSH_BURST: usize = 8;
    /// Throughput hint passed to every `resume` call
    pub const MAX_THROUGHPUT: usize = 1;
    /// Chunk size of the default at-most receive policy
    pub const READ_MAX: usize = 1024;
    /// Datagram size until an adapter configures one
    pub const DATAGRAM_SIZE: usize = 65_535;
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub flush_burst: usize,
    pub max_throughput: usize,
    /// Size of the at-most policy a fresh connection starts with
    pub default_read_max: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MuxConfig {
    /// Defaults overridden by the environment:
    /// - `GVS_MUX_FLUSH_BURST`
    /// - `GVS_MUX_MAX_THROUGHPUT`
    /// - `GVS_MUX_DEFAULT_READ_MAX`
    pub fn from_env() -> Self {
        Self {
            flush_burst: env_get("GVS_MUX_FLUSH_BURST", defaults::FLUSH_BURST),
            max_throughput: env_get("GVS_MUX_MAX_THROUGHPUT", defaults::MAX_THROUGHPUT),
            default_read_max: env_get("GVS_MUX_DEFAULT_READ_MAX", defaults::READ_MAX),
        }
    }

    pub fn new() -> Self {
        Self {
            flush_burst: defaults::FLUSH_BURST,
            max_throughput: defaults::MAX_THROUGHPUT,
            default_read_max: defaults::READ_MAX,
        }
    }

    pub fn flush_burst(mut self, n: usize) -> Self {
        self.flush_burst = n;
        self
    }

    pub fn max_throughput(mut self, n: usize) -> Self {
        self.max_throughput = n;
        self
    }

    pub fn default_read_max(mut self, n: usize) -> Self {
        self.default_read_max = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.flush_burst == 0 {
            return Err("flush_burst must be at least 1");
        }
        if self.max_throughput == 0 {
            return Err("max_throughput must be at least 1");
        }
        if self.default_read_max == 0 {
            return Err("default_read_max must be at least 1");
        }
        Ok(())
    }
}
