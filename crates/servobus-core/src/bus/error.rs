//! Bus errors

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced synchronously by the shared bus
#[derive(Error, Debug)]
pub enum BusError {
    /// The port worker is stopped
    #[error("Port worker is not running")]
    NotRunning,

    /// Another device holds the number
    #[error("Device number {device_number} is already registered to '{existing}'")]
    DuplicateDeviceNumber {
        /// Requested number
        device_number: u8,
        /// Id that already holds it
        existing: String,
    },

    /// The device id is already attached on this port
    #[error("Device '{0}' is already attached")]
    DuplicateDeviceId(String),

    /// Device number outside 1..=127
    #[error("Invalid device number {0} (expected 1-127)")]
    InvalidDeviceNumber(u8),

    /// A detached worker still owns the port
    #[error("Worker for {0} is still shutting down")]
    WorkerUnavailable(String),

    /// No worker exists for the port
    #[error("Unknown port: {0}")]
    UnknownPort(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire or transport failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
