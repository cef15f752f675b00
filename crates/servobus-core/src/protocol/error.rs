//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a servo controller over the wire
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The serial driver reported a failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No transport is open
    #[error("Not connected to servo bus")]
    NotConnected,

    /// Opening the transport failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The named port does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Device number does not fit the address byte
    #[error("Device number {0} is outside the 7-bit address range")]
    InvalidDeviceNumber(u8),

    /// Channel does not fit the channel byte
    #[error("Channel {0} is outside the 7-bit channel range")]
    InvalidChannel(u8),

    /// Read or write failure on the transport
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error means the transport itself is gone and must be reopened
    pub fn is_transport_lost(&self) -> bool {
        match self {
            ProtocolError::SerialError(_) | ProtocolError::NotConnected => true,
            ProtocolError::IoError(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
