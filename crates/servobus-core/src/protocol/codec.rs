//! Frame encoding/decoding
//!
//! Implements the addressed binary frame format used on a shared servo bus.
//!
//! Frame format:
//! - 1 byte: sync marker (0xAA)
//! - 1 byte: device number (0-127)
//! - 1 byte: opcode
//! - N bytes: arguments (channel, then 16-bit values split into two 7-bit bytes)
//!
//! Replies carry no framing: position and error replies are 2 bytes
//! little-endian, status replies a single byte.

use byteorder::{ByteOrder, LittleEndian};

use super::commands::{CommandKind, ControllerErrors, Opcode, Response, ScriptState};
use super::ProtocolError;

/// Sync marker that starts every addressed frame
pub const SYNC_BYTE: u8 = 0xAA;

/// Largest value representable by two 7-bit bytes
pub const MAX_14BIT: u16 = 0x3FFF;

/// Quarter-units per native unit
pub const QUARTER_UNITS: f64 = 4.0;

/// Split a 14-bit value into (low 7 bits, bits 7-13)
pub fn split_7bit(value: u16) -> (u8, u8) {
    ((value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
}

/// Join two 7-bit bytes back into a value
pub fn join_7bit(low: u8, high: u8) -> u16 {
    (low as u16 & 0x7F) | ((high as u16 & 0x7F) << 7)
}

/// Convert a native target into wire quarter-units, clamped to the 14-bit range
pub fn to_quarter_units(target: f64) -> u16 {
    let scaled = (target * QUARTER_UNITS).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        return 0;
    }
    if scaled >= MAX_14BIT as f64 {
        if scaled > MAX_14BIT as f64 {
            tracing::warn!(target, "target exceeds wire range, clamping");
        }
        return MAX_14BIT;
    }
    scaled as u16
}

/// Clamp a raw speed or acceleration to the 14-bit wire range
fn clamp_14bit(value: u16, field: &'static str) -> u16 {
    if value > MAX_14BIT {
        tracing::warn!(value, field, "value exceeds wire range, clamping");
        return MAX_14BIT;
    }
    value
}

/// Convert wire quarter-units back into native units
pub fn from_quarter_units(quarters: u16) -> f64 {
    quarters as f64 / QUARTER_UNITS
}

/// Encode a command for the given device number
pub fn encode(device_number: u8, kind: &CommandKind) -> Result<Vec<u8>, ProtocolError> {
    if device_number > 0x7F {
        return Err(ProtocolError::InvalidDeviceNumber(device_number));
    }
    if let Some(channel) = kind.channel() {
        if channel > 0x7F {
            return Err(ProtocolError::InvalidChannel(channel));
        }
    }

    let builder = FrameBuilder::new(device_number).opcode(kind.opcode());
    let frame = match *kind {
        CommandKind::SetTarget { channel, target } => builder
            .byte(channel)
            .value_7bit(to_quarter_units(target)),
        CommandKind::SetSpeed { channel, speed } => builder
            .byte(channel)
            .value_7bit(clamp_14bit(speed, "speed")),
        CommandKind::SetAcceleration {
            channel,
            acceleration,
        } => builder
            .byte(channel)
            .value_7bit(clamp_14bit(acceleration, "acceleration")),
        CommandKind::GetPosition { channel } => builder.byte(channel),
        CommandKind::GetErrors | CommandKind::GetScriptStatus | CommandKind::GetMovingState => {
            builder
        }
    };
    Ok(frame.build())
}

/// Decode a raw reply for the given command.
///
/// Returns `None` when the reply is shorter than expected; the caller treats
/// that the same as a device that did not answer. Write-only commands decode
/// to [`Response::Ack`].
pub fn decode_response(kind: &CommandKind, data: &[u8]) -> Option<Response> {
    if data.len() < kind.response_len() {
        return None;
    }
    match kind {
        CommandKind::GetPosition { .. } => Some(Response::Position(from_quarter_units(
            LittleEndian::read_u16(&data[0..2]),
        ))),
        CommandKind::GetErrors => Some(Response::Errors(ControllerErrors(
            LittleEndian::read_u16(&data[0..2]),
        ))),
        CommandKind::GetScriptStatus => Some(Response::ScriptStatus(ScriptState::from(data[0]))),
        CommandKind::GetMovingState => Some(Response::MovingState(data[0] != 0)),
        _ => Some(Response::Ack),
    }
}

/// Encode a position reply the way a controller sends it
pub fn encode_position_reply(position: f64) -> [u8; 2] {
    let mut bytes = [0u8; 2];
    LittleEndian::write_u16(&mut bytes, to_quarter_units(position));
    bytes
}

/// A parsed addressed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Addressed device
    pub device_number: u8,
    /// Operation
    pub opcode: Opcode,
    /// Argument bytes
    pub args: Vec<u8>,
}

impl Frame {
    /// Rebuild the logical command carried by this frame
    pub fn kind(&self) -> Option<CommandKind> {
        if self.args.len() < self.opcode.arg_len() {
            return None;
        }
        let value = || join_7bit(self.args[1], self.args[2]);
        let kind = match self.opcode {
            Opcode::SetTarget => CommandKind::SetTarget {
                channel: self.args[0],
                target: from_quarter_units(value()),
            },
            Opcode::SetSpeed => CommandKind::SetSpeed {
                channel: self.args[0],
                speed: value(),
            },
            Opcode::SetAcceleration => CommandKind::SetAcceleration {
                channel: self.args[0],
                acceleration: value(),
            },
            Opcode::GetPosition => CommandKind::GetPosition {
                channel: self.args[0],
            },
            Opcode::GetErrors => CommandKind::GetErrors,
            Opcode::GetScriptStatus => CommandKind::GetScriptStatus,
            Opcode::GetMovingState => CommandKind::GetMovingState,
        };
        Some(kind)
    }
}

/// Parse one frame from the start of `data`.
///
/// Bytes before the first usable sync marker are skipped; a sync byte not
/// followed by a device number and a known opcode is treated as noise.
/// Returns the frame and the number of bytes consumed, or `None` if no
/// complete frame is available yet.
pub fn parse_frame(data: &[u8]) -> Option<(Frame, usize)> {
    let mut from = 0;
    loop {
        let start = from + data[from..].iter().position(|&b| b == SYNC_BYTE)?;
        let rest = &data[start..];
        if rest.len() < 3 {
            return None;
        }
        let opcode = match Opcode::from_byte(rest[2]) {
            Some(opcode) if rest[1] <= 0x7F => opcode,
            _ => {
                from = start + 1;
                continue;
            }
        };
        let total = 3 + opcode.arg_len();
        if rest.len() < total {
            return None;
        }
        let frame = Frame {
            device_number: rest[1],
            opcode,
            args: rest[3..total].to_vec(),
        };
        return Some((frame, start + total));
    }
}

/// Builder for constructing addressed frames
pub struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame for the given device number
    pub fn new(device_number: u8) -> Self {
        Self {
            bytes: vec![SYNC_BYTE, device_number & 0x7F],
        }
    }

    /// Add the opcode byte
    pub fn opcode(mut self, opcode: Opcode) -> Self {
        self.bytes.push(opcode.byte());
        self
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.bytes.push(b);
        self
    }

    /// Add a 14-bit value as two 7-bit bytes (low first)
    pub fn value_7bit(mut self, value: u16) -> Self {
        let (low, high) = split_7bit(value);
        self.bytes.push(low);
        self.bytes.push(high);
        self
    }

    /// Build the frame
    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_7bit() {
        assert_eq!(split_7bit(6000), (0x70, 0x2E));
        assert_eq!(join_7bit(0x70, 0x2E), 6000);
        assert_eq!(split_7bit(MAX_14BIT), (0x7F, 0x7F));
    }

    #[test]
    fn test_quarter_unit_clamping() {
        assert_eq!(to_quarter_units(1500.0), 6000);
        assert_eq!(to_quarter_units(1500.25), 6001);
        assert_eq!(to_quarter_units(-10.0), 0);
        assert_eq!(to_quarter_units(10_000.0), MAX_14BIT);
        assert_eq!(to_quarter_units(f64::NAN), 0);
    }

    #[test]
    fn test_set_speed_is_not_scaled() {
        let bytes = encode(1, &CommandKind::SetSpeed { channel: 2, speed: 140 }).unwrap();
        assert_eq!(bytes, vec![SYNC_BYTE, 1, 0x07, 2, 140 & 0x7F, 140 >> 7]);
    }

    #[test]
    fn test_speed_and_acceleration_clamped() {
        // 0x4000 would otherwise wrap to 0, which means "unlimited"
        let bytes = encode(1, &CommandKind::SetSpeed { channel: 0, speed: 0x4000 }).unwrap();
        assert_eq!(bytes, vec![SYNC_BYTE, 1, 0x07, 0, 0x7F, 0x7F]);
        let bytes = encode(
            1,
            &CommandKind::SetAcceleration {
                channel: 0,
                acceleration: u16::MAX,
            },
        )
        .unwrap();
        assert_eq!(bytes, vec![SYNC_BYTE, 1, 0x09, 0, 0x7F, 0x7F]);
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(matches!(
            encode(200, &CommandKind::GetErrors),
            Err(ProtocolError::InvalidDeviceNumber(200))
        ));
        assert!(matches!(
            encode(1, &CommandKind::GetPosition { channel: 130 }),
            Err(ProtocolError::InvalidChannel(130))
        ));
    }

    #[test]
    fn test_parse_frame_skips_garbage() {
        let mut data = vec![0x00, 0x13];
        data.extend(encode(12, &CommandKind::GetPosition { channel: 3 }).unwrap());
        let (frame, used) = parse_frame(&data).unwrap();
        assert_eq!(used, data.len());
        assert_eq!(frame.device_number, 12);
        assert_eq!(frame.kind(), Some(CommandKind::GetPosition { channel: 3 }));
    }

    #[test]
    fn test_parse_frame_skips_bad_sync() {
        // Sync followed by an unknown opcode, then a valid read
        let data = [SYNC_BYTE, 0x01, 0x7F, SYNC_BYTE, 0x0C, 0x10, 0x03];
        let (frame, used) = parse_frame(&data).unwrap();
        assert_eq!(used, data.len());
        assert_eq!(frame.device_number, 12);
        assert_eq!(frame.kind(), Some(CommandKind::GetPosition { channel: 3 }));

        // A sync byte where the device number should be starts the next frame
        let data = [SYNC_BYTE, SYNC_BYTE, 0x05, 0x10, 0x00];
        let (frame, used) = parse_frame(&data).unwrap();
        assert_eq!(used, 5);
        assert_eq!(frame.device_number, 5);
    }

    #[test]
    fn test_parse_incomplete_frame() {
        assert!(parse_frame(&[SYNC_BYTE, 12, 0x04, 5]).is_none());
        assert!(parse_frame(&[]).is_none());
    }

    #[test]
    fn test_short_reply_is_none() {
        assert_eq!(decode_response(&CommandKind::GetPosition { channel: 0 }, &[0x70]), None);
        assert_eq!(decode_response(&CommandKind::GetMovingState, &[]), None);
        assert_eq!(
            decode_response(&CommandKind::GetMovingState, &[1]),
            Some(Response::MovingState(true))
        );
    }
}
