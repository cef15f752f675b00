//! Protocol commands
//!
//! Defines the operations a servo controller understands on the shared bus
//! and the typed values decoded from its replies.

use serde::{Deserialize, Serialize};

/// Wire opcodes (the addressed form of the controller's command bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Set the target of one channel (quarter-unit resolution)
    SetTarget = 0x04,
    /// Set the speed limit of one channel
    SetSpeed = 0x07,
    /// Set the acceleration limit of one channel
    SetAcceleration = 0x09,
    /// Read the current position of one channel
    GetPosition = 0x10,
    /// Ask whether any servo is still moving
    GetMovingState = 0x13,
    /// Read and clear the controller error register
    GetErrors = 0x21,
    /// Ask whether the on-board script is running
    GetScriptStatus = 0x2E,
}

impl Opcode {
    /// Raw opcode byte
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Look up an opcode from its byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x04 => Some(Opcode::SetTarget),
            0x07 => Some(Opcode::SetSpeed),
            0x09 => Some(Opcode::SetAcceleration),
            0x10 => Some(Opcode::GetPosition),
            0x13 => Some(Opcode::GetMovingState),
            0x21 => Some(Opcode::GetErrors),
            0x2E => Some(Opcode::GetScriptStatus),
            _ => None,
        }
    }

    /// Number of argument bytes following the opcode
    pub fn arg_len(self) -> usize {
        match self {
            Opcode::SetTarget | Opcode::SetSpeed | Opcode::SetAcceleration => 3,
            Opcode::GetPosition => 1,
            Opcode::GetMovingState | Opcode::GetErrors | Opcode::GetScriptStatus => 0,
        }
    }
}

/// A logical operation together with its kind-specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Move a channel to `target` (native units, e.g. microseconds)
    SetTarget {
        /// Output channel
        channel: u8,
        /// Target in native units
        target: f64,
    },
    /// Limit how fast a channel moves towards its target
    SetSpeed {
        /// Output channel
        channel: u8,
        /// Speed limit, 0 for unlimited
        speed: u16,
    },
    /// Limit how fast a channel's speed may change
    SetAcceleration {
        /// Output channel
        channel: u8,
        /// Acceleration limit, 0 for unlimited
        acceleration: u16,
    },
    /// Read a channel's current position
    GetPosition {
        /// Output channel
        channel: u8,
    },
    /// Read the error register
    GetErrors,
    /// Read the script status
    GetScriptStatus,
    /// Read whether any output is still moving
    GetMovingState,
}

impl CommandKind {
    /// Opcode used on the wire
    pub fn opcode(&self) -> Opcode {
        match self {
            CommandKind::SetTarget { .. } => Opcode::SetTarget,
            CommandKind::SetSpeed { .. } => Opcode::SetSpeed,
            CommandKind::SetAcceleration { .. } => Opcode::SetAcceleration,
            CommandKind::GetPosition { .. } => Opcode::GetPosition,
            CommandKind::GetErrors => Opcode::GetErrors,
            CommandKind::GetScriptStatus => Opcode::GetScriptStatus,
            CommandKind::GetMovingState => Opcode::GetMovingState,
        }
    }

    /// Channel addressed by this command, if any
    pub fn channel(&self) -> Option<u8> {
        match self {
            CommandKind::SetTarget { channel, .. }
            | CommandKind::SetSpeed { channel, .. }
            | CommandKind::SetAcceleration { channel, .. }
            | CommandKind::GetPosition { channel } => Some(*channel),
            _ => None,
        }
    }

    /// Check if this command expects a reply
    pub fn expects_response(&self) -> bool {
        self.response_len() > 0
    }

    /// Size of the reply in bytes (0 for write-only commands)
    pub fn response_len(&self) -> usize {
        match self {
            CommandKind::GetPosition { .. } | CommandKind::GetErrors => 2,
            CommandKind::GetScriptStatus | CommandKind::GetMovingState => 1,
            _ => 0,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::SetTarget { .. } => "set_target",
            CommandKind::SetSpeed { .. } => "set_speed",
            CommandKind::SetAcceleration { .. } => "set_acceleration",
            CommandKind::GetPosition { .. } => "get_position",
            CommandKind::GetErrors => "get_errors",
            CommandKind::GetScriptStatus => "get_script_status",
            CommandKind::GetMovingState => "get_moving_state",
        }
    }
}

/// A decoded reply, or the acknowledgement of a write-only command
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Channel position in native units
    Position(f64),
    /// Error register contents
    Errors(ControllerErrors),
    /// Script state
    ScriptStatus(ScriptState),
    /// `true` while at least one output is still moving
    MovingState(bool),
    /// A write-only command was transmitted
    Ack,
}

impl Response {
    /// Position value, if this is a position reply
    pub fn position(&self) -> Option<f64> {
        match self {
            Response::Position(value) => Some(*value),
            _ => None,
        }
    }
}

/// Controller error register (bitmask)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerErrors(pub u16);

impl ControllerErrors {
    /// Framing error on the line
    pub const SERIAL_SIGNAL: u16 = 1 << 0;
    /// UART overrun
    pub const SERIAL_OVERRUN: u16 = 1 << 1;
    /// Receive buffer full
    pub const SERIAL_BUFFER_FULL: u16 = 1 << 2;
    /// Bad CRC byte
    pub const SERIAL_CRC: u16 = 1 << 3;
    /// Malformed command
    pub const SERIAL_PROTOCOL: u16 = 1 << 4;
    /// Serial timeout elapsed
    pub const SERIAL_TIMEOUT: u16 = 1 << 5;
    /// Script stack over- or underflow
    pub const SCRIPT_STACK: u16 = 1 << 6;
    /// Script call stack over- or underflow
    pub const SCRIPT_CALL_STACK: u16 = 1 << 7;
    /// Script jumped out of bounds
    pub const SCRIPT_PROGRAM_COUNTER: u16 = 1 << 8;

    const NAMES: [(u16, &'static str); 9] = [
        (Self::SERIAL_SIGNAL, "serial signal"),
        (Self::SERIAL_OVERRUN, "serial overrun"),
        (Self::SERIAL_BUFFER_FULL, "serial buffer full"),
        (Self::SERIAL_CRC, "serial CRC"),
        (Self::SERIAL_PROTOCOL, "serial protocol"),
        (Self::SERIAL_TIMEOUT, "serial timeout"),
        (Self::SCRIPT_STACK, "script stack"),
        (Self::SCRIPT_CALL_STACK, "script call stack"),
        (Self::SCRIPT_PROGRAM_COUNTER, "script program counter"),
    ];

    /// Raw register value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// No error bit set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check a single flag
    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    /// Human-readable names of the set bits
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// State of the controller's on-board script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptState {
    /// Script is executing
    Running,
    /// Script is stopped or absent
    Stopped,
}

impl From<u8> for ScriptState {
    fn from(byte: u8) -> Self {
        if byte == 0 {
            ScriptState::Running
        } else {
            ScriptState::Stopped
        }
    }
}
