//! Serial port handling
//!
//! Opening and enumerating the UART lines servo controllers hang off.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::time::Duration;

use super::ProtocolError;

/// USB vendor id of Pololu, whose Maestro controllers speak this protocol
pub const POLOLU_VID: u16 = 0x1FFB;

/// A serial port that could carry a servo bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,
    /// USB vendor and product id, for USB adapters
    pub usb_id: Option<(u16, u16)>,
    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    /// Whether the port belongs to a known servo controller
    pub fn is_servo_controller(&self) -> bool {
        matches!(self.usb_id, Some((vid, _)) if vid == POLOLU_VID)
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => Self {
                name: info.port_name,
                usb_id: None,
                product: None,
            },
        }
    }
}

/// Known controllers first, then other USB adapters, then everything else
fn rank(port: &PortInfo) -> u8 {
    match port.usb_id {
        _ if port.is_servo_controller() => 0,
        Some(_) => 1,
        None => 2,
    }
}

/// Serial ports on this machine, most likely servo buses first
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name)));
    ports.dedup_by(|a, b| a.name == b.name);
    ports
}

/// Open `name` as an 8N1 line without flow control
pub fn open_port(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let port = serialport::new(name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(read_timeout)
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice
            | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ProtocolError::PortNotFound(name.to_string())
            }
            _ => ProtocolError::ConnectionFailed(format!("{}: {}", name, e)),
        })?;

    // Drop whatever a previous session left on the line
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    Ok(port)
}
