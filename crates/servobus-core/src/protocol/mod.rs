//! Servo Bus Protocol
//!
//! Implements the addressed serial protocol spoken by servo controllers that
//! share one serial line, plus the transport the bus worker drives.

/// Frame encoding and decoding
pub mod codec;
/// Opcodes, commands and replies
pub mod commands;
mod error;
/// Serial port discovery and opening
pub mod serial;
/// Channel and connector traits
pub mod transport;

pub use codec::{decode_response, encode, parse_frame, Frame, FrameBuilder, SYNC_BYTE};
pub use commands::{CommandKind, ControllerErrors, Opcode, Response, ScriptState};
pub use error::ProtocolError;
pub use serial::{list_ports, open_port, PortInfo, POLOLU_VID};
pub use transport::{read_reply, Channel, Connector, SerialChannel, SerialConnector};

/// Default baud rate for servo controllers on a UART line
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default timeout for replies in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Highest addressable device number
pub const MAX_DEVICE_NUMBER: u8 = 127;
