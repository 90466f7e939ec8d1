//! Session configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing and buffer limits of the I/O pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpTimeouts {
    /// Timeout for writing one command (milliseconds)
    pub write_ms: u64,
    /// Timeout of a single transport read (milliseconds)
    pub read_ms: u64,
    /// Budget for a complete reply (milliseconds)
    pub total_ms: u64,
    /// Pause after a read that returned nothing (milliseconds)
    pub idle_sleep_ms: u64,
    /// Size of one transport read
    pub read_buffer_size: usize,
}

impl Default for PumpTimeouts {
    fn default() -> Self {
        Self {
            write_ms: 500,
            read_ms: 1500,
            total_ms: 4000,
            idle_sleep_ms: 5,
            read_buffer_size: 2048,
        }
    }
}

impl PumpTimeouts {
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

/// Session configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial number of the adapter to connect to (empty: any single adapter)
    pub target_serial: String,
    /// I/O pump limits
    pub timeouts: PumpTimeouts,
}

impl SessionConfig {
    /// Load configuration from an optional file, overridden by `ELM_*`
    /// environment variables (nested keys use `__`, e.g.
    /// `ELM_TIMEOUTS__TOTAL_MS`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("ELM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
