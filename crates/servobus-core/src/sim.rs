//! Simulated servo bus
//!
//! An in-memory bus with any number of controllers on it, for running the
//! bus stack without hardware. Frames written by the worker are parsed and
//! applied to the simulated controllers, which answer reads the way real
//! controllers do. Faults (unplugged port, failing writes, silent or
//! truncated replies, random drops) can be switched on at any time.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::codec::encode_position_reply;
use crate::protocol::{parse_frame, Channel, CommandKind, Connector, Frame, ProtocolError};

/// State of one simulated controller
#[derive(Debug, Clone, PartialEq)]
pub struct SimController {
    /// Number of outputs
    pub channel_count: u8,
    /// Per-channel target; positions reach their target instantly
    pub targets: Vec<f64>,
    /// Speed limit per channel
    pub speeds: Vec<u16>,
    /// Acceleration limit per channel
    pub accelerations: Vec<u16>,
    /// Error register, cleared when read
    pub errors: u16,
    /// Whether the script is reported as running
    pub script_running: bool,
    /// Whether outputs are reported as moving
    pub moving: bool,
}

impl SimController {
    fn new(channel_count: u8) -> Self {
        let n = channel_count as usize;
        Self {
            channel_count,
            targets: vec![0.0; n],
            speeds: vec![0; n],
            accelerations: vec![0; n],
            errors: 0,
            script_running: false,
            moving: false,
        }
    }
}

struct SimState {
    controllers: BTreeMap<u8, SimController>,
    online: bool,
    fail_writes: bool,
    silent: bool,
    short_replies: bool,
    drop_rate: f64,
    rng: StdRng,
    /// Bytes written but not yet forming a complete frame
    partial: Vec<u8>,
    /// Reply bytes waiting to be read by the host
    rx: VecDeque<u8>,
    frames: Vec<Frame>,
    connects: u64,
}

impl SimState {
    fn apply(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        let kind = frame.kind()?;
        let controller = self.controllers.get_mut(&frame.device_number)?;
        if let Some(channel) = kind.channel() {
            if channel >= controller.channel_count {
                return None;
            }
        }

        match kind {
            CommandKind::SetTarget { channel, target } => {
                controller.targets[channel as usize] = target;
                None
            }
            CommandKind::SetSpeed { channel, speed } => {
                controller.speeds[channel as usize] = speed;
                None
            }
            CommandKind::SetAcceleration {
                channel,
                acceleration,
            } => {
                controller.accelerations[channel as usize] = acceleration;
                None
            }
            CommandKind::GetPosition { channel } => {
                Some(encode_position_reply(controller.targets[channel as usize]).to_vec())
            }
            CommandKind::GetErrors => {
                let errors = std::mem::take(&mut controller.errors);
                Some(errors.to_le_bytes().to_vec())
            }
            CommandKind::GetScriptStatus => Some(vec![if controller.script_running { 0 } else { 1 }]),
            CommandKind::GetMovingState => Some(vec![controller.moving as u8]),
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        while let Some((frame, used)) = parse_frame(&self.partial) {
            self.partial.drain(..used);
            let reply = self.apply(&frame);
            self.frames.push(frame);

            let Some(mut reply) = reply else { continue };
            if self.silent {
                continue;
            }
            if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
                continue;
            }
            if self.short_replies {
                reply.truncate(reply.len().saturating_sub(1));
            }
            self.rx.extend(reply);
        }
    }
}

/// Handle to a simulated bus. Clones share the same bus.
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Create an empty, online bus
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Create a bus whose reply drops follow `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                controllers: BTreeMap::new(),
                online: true,
                fail_writes: false,
                silent: false,
                short_replies: false,
                drop_rate: 0.0,
                rng: StdRng::seed_from_u64(seed),
                partial: Vec::new(),
                rx: VecDeque::new(),
                frames: Vec::new(),
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a controller with `channel_count` channels on the bus
    pub fn add_controller(&self, device_number: u8, channel_count: u8) -> &Self {
        self.lock()
            .controllers
            .insert(device_number, SimController::new(channel_count));
        self
    }

    /// Unplug a controller from the bus
    pub fn remove_controller(&self, device_number: u8) -> Option<SimController> {
        self.lock().controllers.remove(&device_number)
    }

    /// Snapshot of a controller
    pub fn controller(&self, device_number: u8) -> Option<SimController> {
        self.lock().controllers.get(&device_number).cloned()
    }

    /// Current target of one channel
    pub fn target(&self, device_number: u8, channel: u8) -> Option<f64> {
        self.lock()
            .controllers
            .get(&device_number)
            .and_then(|c| c.targets.get(channel as usize).copied())
    }

    /// Move a channel as if something else had driven it
    pub fn set_position(&self, device_number: u8, channel: u8, position: f64) {
        if let Some(slot) = self
            .lock()
            .controllers
            .get_mut(&device_number)
            .and_then(|c| c.targets.get_mut(channel as usize))
        {
            *slot = position;
        }
    }

    /// Set the error register
    pub fn set_errors(&self, device_number: u8, errors: u16) {
        if let Some(c) = self.lock().controllers.get_mut(&device_number) {
            c.errors = errors;
        }
    }

    /// Set the reported script state
    pub fn set_script_running(&self, device_number: u8, running: bool) {
        if let Some(c) = self.lock().controllers.get_mut(&device_number) {
            c.script_running = running;
        }
    }

    /// Set the reported moving state
    pub fn set_moving(&self, device_number: u8, moving: bool) {
        if let Some(c) = self.lock().controllers.get_mut(&device_number) {
            c.moving = moving;
        }
    }

    /// Plug or unplug the port. While offline, connects and writes fail.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            state.rx.clear();
            state.partial.clear();
        }
    }

    /// Whether the bus is plugged in
    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Make every write fail with a broken pipe
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Accept frames but never answer
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Answer with one byte less than expected
    pub fn set_short_replies(&self, short: bool) {
        self.lock().short_replies = short;
    }

    /// Probability (0.0-1.0) that a reply is lost
    pub fn set_drop_rate(&self, rate: f64) {
        self.lock().drop_rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
    }

    /// Every frame received so far, in arrival order
    pub fn frames(&self) -> Vec<Frame> {
        self.lock().frames.clone()
    }

    /// Received frames decoded into (device number, command)
    pub fn commands(&self) -> Vec<(u8, CommandKind)> {
        self.lock()
            .frames
            .iter()
            .filter_map(|f| f.kind().map(|k| (f.device_number, k)))
            .collect()
    }

    /// Forget recorded frames
    pub fn clear_frames(&self) {
        self.lock().frames.clear();
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    /// Connector that opens channels onto this bus
    pub fn connector(&self) -> SimConnector {
        SimConnector { bus: self.clone() }
    }
}

/// Connector for a [`SimulatedBus`]
pub struct SimConnector {
    bus: SimulatedBus,
}

impl Connector for SimConnector {
    fn describe(&self) -> String {
        "simulated bus".to_string()
    }

    fn connect(&mut self) -> Result<Box<dyn Channel>, ProtocolError> {
        let mut state = self.bus.lock();
        if !state.online {
            return Err(ProtocolError::ConnectionFailed(
                "simulated bus offline".to_string(),
            ));
        }
        state.connects += 1;
        state.rx.clear();
        state.partial.clear();
        drop(state);
        Ok(Box::new(SimChannel {
            bus: self.bus.clone(),
        }))
    }
}

/// Open channel onto a [`SimulatedBus`]
pub struct SimChannel {
    bus: SimulatedBus,
}

impl Read for SimChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.bus.lock();
        if !state.online {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"));
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.bus.lock();
        if !state.online {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        state.receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for SimChannel {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.bus.lock().rx.clear();
        Ok(())
    }
}
