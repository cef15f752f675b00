//! Bus configuration
//!
//! Timing and retry settings shared by every port a [`crate::bus::PortManager`]
//! opens. All fields have defaults so a partial JSON document is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bus::BusError;
use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Settings for a shared servo bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Baud rate used when opening serial ports
    pub baud_rate: u32,

    /// How long the worker waits for a command before running housekeeping
    pub poll_interval_ms: u64,

    /// Pause after every executed command
    pub inter_command_delay_ms: u64,

    /// Reply timeout for commands that do not set their own
    pub default_timeout_ms: u64,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Upper bound on waiting for the worker thread at stop
    pub stop_join_timeout_ms: u64,

    /// Timeout of a single blocking serial read
    pub read_timeout_ms: u64,

    /// Target sent to every channel on emergency stop
    pub neutral_target: f64,

    /// Channel count assumed until a controller's size is known
    pub default_channel_count: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            poll_interval_ms: 100,
            inter_command_delay_ms: 1,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 3,
            stop_join_timeout_ms: 2000,
            read_timeout_ms: 50,
            neutral_target: 1500.0,
            default_channel_count: 6,
        }
    }
}

impl BusConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, BusError> {
        serde_json::from_str(json).map_err(|e| BusError::Config(e.to_string()))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    /// Idle wait between housekeeping passes
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause after each command
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    /// Reply timeout for new commands
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// How long stop waits for the worker thread
    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }

    /// Timeout of one blocking serial read
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
