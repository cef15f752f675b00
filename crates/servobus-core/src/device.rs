//! Virtual device handle
//!
//! A [`ServoController`] is the per-controller API. It turns calls into
//! [`Command`]s for its port's worker and never touches the transport itself.
//! Writes are fire-and-forget: the return value says whether the command was
//! queued, not whether it reached the device.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::bus::{
    BusError, Command, PortStats, PortWorker, Priority, RegistrationConflict, VirtualDevice,
};
use crate::protocol::{CommandKind, ControllerErrors, Response, ScriptState, MAX_DEVICE_NUMBER};

/// Channel counts of the controller sizes probed by
/// [`ServoController::detect_channel_count`], largest first
pub const KNOWN_CHANNEL_COUNTS: [u8; 4] = [24, 18, 12, 6];

/// Status of one controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// Logical id
    pub device_id: String,
    /// Wire address
    pub device_number: u8,
    /// Whether the port is connected
    pub connected: bool,
    /// Known channel count
    pub channel_count: Option<u8>,
    /// Statistics of the shared port
    pub port: PortStats,
}

/// Handle for one addressable servo controller on a shared port
pub struct ServoController {
    worker: Arc<PortWorker>,
    device_id: String,
    device_number: u8,
}

impl std::fmt::Debug for ServoController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServoController")
            .field("port", &self.worker.port_name())
            .field("device_id", &self.device_id)
            .field("device_number", &self.device_number)
            .finish()
    }
}

impl ServoController {
    /// Register a device on `worker` and return its handle.
    ///
    /// Fails if `device_number` is out of range, already taken, or the id is
    /// already attached on this port.
    pub fn attach(
        worker: Arc<PortWorker>,
        device_id: impl Into<String>,
        device_number: u8,
    ) -> Result<Self, BusError> {
        if device_number == 0 || device_number > MAX_DEVICE_NUMBER {
            return Err(BusError::InvalidDeviceNumber(device_number));
        }
        let device_id = device_id.into();
        match worker
            .registry()
            .register_new(VirtualDevice::new(device_id.clone(), device_number))
        {
            Ok(()) => {}
            Err(RegistrationConflict::IdTaken) => {
                return Err(BusError::DuplicateDeviceId(device_id));
            }
            Err(RegistrationConflict::NumberTaken(existing)) => {
                return Err(BusError::DuplicateDeviceNumber {
                    device_number,
                    existing,
                });
            }
        }
        tracing::info!(
            port = worker.port_name(),
            device_id = %device_id,
            device_number,
            "controller attached"
        );
        Ok(Self {
            worker,
            device_id,
            device_number,
        })
    }

    /// Logical id
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Wire address
    pub fn device_number(&self) -> u8 {
        self.device_number
    }

    /// Port the controller sits on
    pub fn port_name(&self) -> &str {
        self.worker.port_name()
    }

    /// Worker that owns this controller's port
    pub fn worker(&self) -> &Arc<PortWorker> {
        &self.worker
    }

    /// Known channel count, if configured or detected
    pub fn channel_count(&self) -> Option<u8> {
        self.worker
            .registry()
            .get(&self.device_id)
            .and_then(|d| d.channel_count)
    }

    /// Record the channel count instead of detecting it
    pub fn set_channel_count(&mut self, channel_count: u8) {
        self.worker
            .registry()
            .set_channel_count(&self.device_id, channel_count);
    }

    /// Channel count used for whole-controller operations
    fn effective_channel_count(&self) -> u8 {
        self.channel_count()
            .unwrap_or(self.worker.config().default_channel_count)
    }

    fn command(&self, kind: CommandKind, priority: Priority) -> Command {
        let config = self.worker.config();
        Command::new(self.device_id.clone(), self.device_number, kind, priority)
            .with_timeout(config.default_timeout())
            .with_max_retries(config.max_retries)
    }

    fn submit(&self, command: Command) -> bool {
        match self.worker.submit(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(device_id = %self.device_id, error = %e, "enqueue failed");
                false
            }
        }
    }

    /// Move `channel` to `target` (native units)
    pub fn set_target(&self, channel: u8, target: f64, priority: Priority) -> bool {
        self.submit(self.command(CommandKind::SetTarget { channel, target }, priority))
    }

    /// Limit the speed of `channel` (0 = unlimited)
    pub fn set_speed(&self, channel: u8, speed: u16, priority: Priority) -> bool {
        self.submit(self.command(CommandKind::SetSpeed { channel, speed }, priority))
    }

    /// Limit the acceleration of `channel` (0 = unlimited)
    pub fn set_acceleration(&self, channel: u8, acceleration: u16, priority: Priority) -> bool {
        self.submit(self.command(
            CommandKind::SetAcceleration {
                channel,
                acceleration,
            },
            priority,
        ))
    }

    /// Read a channel position. `callback` gets the position or `None` on
    /// failure or timeout, exactly once.
    pub fn get_position<F>(&self, channel: u8, callback: F, priority: Priority) -> bool
    where
        F: FnOnce(Option<f64>) + Send + 'static,
    {
        self.get_position_with_timeout(channel, callback, priority, None)
    }

    fn get_position_with_timeout<F>(
        &self,
        channel: u8,
        callback: F,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> bool
    where
        F: FnOnce(Option<f64>) + Send + 'static,
    {
        let mut command = self
            .command(CommandKind::GetPosition { channel }, priority)
            .with_callback(move |response| callback(response.and_then(|r| r.position())));
        if let Some(timeout) = timeout {
            command = command.with_timeout(timeout);
        }
        self.submit(command)
    }

    /// Blocking position read. Returns `None` if no reply arrives within
    /// `timeout` (plus one housekeeping pass).
    pub fn get_position_sync(&self, channel: u8, timeout: Duration) -> Option<f64> {
        let (tx, rx) = mpsc::sync_channel(1);
        let queued = self.get_position_with_timeout(
            channel,
            move |value| {
                let _ = tx.send(value);
            },
            Priority::Normal,
            Some(timeout),
        );
        if !queued {
            return None;
        }
        // An unanswered read is only released by the worker's next sweep
        let grace = self.worker.config().poll_interval() * 2 + Duration::from_millis(50);
        rx.recv_timeout(timeout + grace).ok().flatten()
    }

    /// Async position read
    pub fn get_position_async(
        &self,
        channel: u8,
        priority: Priority,
    ) -> impl Future<Output = Option<f64>> + Send + 'static {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.get_position(
            channel,
            move |value| {
                let _ = tx.send(value);
            },
            priority,
        );
        async move { rx.await.ok().flatten() }
    }

    /// Read every channel and call `callback` once with all positions that
    /// answered. Returns whether every read was queued.
    pub fn get_all_positions_batch<F>(&self, callback: F) -> bool
    where
        F: FnOnce(HashMap<u8, f64>) + Send + 'static,
    {
        let count = self.effective_channel_count();
        if count == 0 {
            callback(HashMap::new());
            return true;
        }

        let batch = Arc::new(Mutex::new(PositionBatch {
            remaining: count as usize,
            positions: HashMap::with_capacity(count as usize),
            callback: Some(Box::new(callback)),
        }));

        let mut all_queued = true;
        for channel in 0..count {
            let batch = batch.clone();
            all_queued &= self.get_position(
                channel,
                move |value| PositionBatch::record(&batch, channel, value),
                Priority::Normal,
            );
        }
        all_queued
    }

    /// Send every channel to the neutral target at emergency priority.
    ///
    /// Attempts every channel even if one fails to queue.
    pub fn emergency_stop(&self) -> bool {
        let neutral = self.worker.config().neutral_target;
        let count = self.effective_channel_count();
        tracing::warn!(
            device_id = %self.device_id,
            device_number = self.device_number,
            channels = count,
            "emergency stop"
        );
        (0..count).fold(true, |ok, channel| {
            self.set_target(channel, neutral, Priority::Emergency) && ok
        })
    }

    /// Read (and clear) the controller error register
    pub fn get_errors<F>(&self, callback: F, priority: Priority) -> bool
    where
        F: FnOnce(Option<ControllerErrors>) + Send + 'static,
    {
        self.submit(
            self.command(CommandKind::GetErrors, priority)
                .with_callback(move |response| {
                    callback(match response {
                        Some(Response::Errors(errors)) => Some(errors),
                        _ => None,
                    })
                }),
        )
    }

    /// Read whether the on-board script runs
    pub fn get_script_status<F>(&self, callback: F, priority: Priority) -> bool
    where
        F: FnOnce(Option<ScriptState>) + Send + 'static,
    {
        self.submit(
            self.command(CommandKind::GetScriptStatus, priority)
                .with_callback(move |response| {
                    callback(match response {
                        Some(Response::ScriptStatus(state)) => Some(state),
                        _ => None,
                    })
                }),
        )
    }

    /// Read whether any output is still moving
    pub fn get_moving_state<F>(&self, callback: F, priority: Priority) -> bool
    where
        F: FnOnce(Option<bool>) + Send + 'static,
    {
        self.submit(
            self.command(CommandKind::GetMovingState, priority)
                .with_callback(move |response| {
                    callback(match response {
                        Some(Response::MovingState(moving)) => Some(moving),
                        _ => None,
                    })
                }),
        )
    }

    /// Find the controller size by reading the last channel of each known
    /// size, largest first. The first size that answers is recorded.
    pub fn detect_channel_count(&mut self, timeout: Duration) -> Option<u8> {
        for count in KNOWN_CHANNEL_COUNTS {
            if self.get_position_sync(count - 1, timeout).is_some() {
                tracing::info!(
                    device_id = %self.device_id,
                    channel_count = count,
                    "detected channel count"
                );
                self.set_channel_count(count);
                return Some(count);
            }
        }
        tracing::warn!(device_id = %self.device_id, "channel count detection failed");
        None
    }

    /// Status snapshot, including the port statistics
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            device_id: self.device_id.clone(),
            device_number: self.device_number,
            connected: self.worker.is_connected(),
            channel_count: self.channel_count(),
            port: self.worker.stats(),
        }
    }
}

impl Drop for ServoController {
    fn drop(&mut self) {
        self.worker.registry().unregister(&self.device_id);
    }
}

type BatchCallback = Box<dyn FnOnce(HashMap<u8, f64>) + Send>;

/// Aggregates per-channel reads of one batch
struct PositionBatch {
    remaining: usize,
    positions: HashMap<u8, f64>,
    callback: Option<BatchCallback>,
}

impl PositionBatch {
    fn record(batch: &Mutex<PositionBatch>, channel: u8, value: Option<f64>) {
        let finished = {
            let mut state = batch.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(position) = value {
                state.positions.insert(channel, position);
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                state
                    .callback
                    .take()
                    .map(|cb| (cb, std::mem::take(&mut state.positions)))
            } else {
                None
            }
        };
        if let Some((callback, positions)) = finished {
            callback(positions);
        }
    }
}
