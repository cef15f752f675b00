//! Transport abstraction
//!
//! The worker only ever sees a [`Channel`]; a [`Connector`] produces one on
//! every (re)connect so the port can be reopened after it disappears.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use super::serial::open_port;
use super::ProtocolError;

/// Abstraction for the byte stream a bus worker drives
pub trait Channel: Read + Write + Send {
    /// Set timeout for blocking reads
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard bytes that arrived before the current request
    fn clear_input_buffer(&mut self) -> io::Result<()>;
}

/// Opens (and re-opens) the channel for one physical port
pub trait Connector: Send {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Open a fresh channel
    fn connect(&mut self) -> Result<Box<dyn Channel>, ProtocolError>;
}

/// Serial port wrapper implementing Channel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }
}

/// Connector for a real serial device
#[derive(Debug, Clone)]
pub struct SerialConnector {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout applied to each blocking read
    pub read_timeout: Duration,
}

impl SerialConnector {
    /// Connector for `port_name`
    pub fn new(port_name: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout,
        }
    }
}

impl Connector for SerialConnector {
    fn describe(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }

    fn connect(&mut self) -> Result<Box<dyn Channel>, ProtocolError> {
        let port = open_port(&self.port_name, self.baud_rate, self.read_timeout)?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}

/// Read exactly `len` bytes, giving up at `timeout`.
///
/// Returns whatever arrived before the deadline; a short result is not an
/// error. Only hard I/O failures are reported as `Err`.
pub fn read_reply(
    channel: &mut dyn Channel,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, ProtocolError> {
    let mut reply = vec![0u8; len];
    let mut got = 0;
    let deadline = Instant::now() + timeout;

    while got < len {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let _ = channel.set_timeout(deadline - now);
        match channel.read(&mut reply[got..]) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => got += n,
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(ProtocolError::IoError(e)),
        }
    }

    reply.truncate(got);
    Ok(reply)
}
