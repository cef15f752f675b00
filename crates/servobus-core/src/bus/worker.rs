//! Shared port worker
//!
//! One worker thread per physical port. It is the only code that touches the
//! transport: it pops commands in priority order, encodes and writes them,
//! reads replies, and hands results to the response correlator. When idle it
//! sweeps timed-out responses and tries to reconnect a lost transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::command::{Command, CommandId};
use super::correlator::ResponseCorrelator;
use super::queue::{CommandQueue, QueueEntry};
use super::registry::DeviceRegistry;
use super::BusError;
use crate::config::BusConfig;
use crate::protocol::{
    decode_response, encode, read_reply, Channel, Connector, ProtocolError, Response,
};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// No worker thread
    Stopped,
    /// Worker started, initial connection in progress
    Connecting,
    /// Worker running with the transport open
    Running,
    /// Worker running, transport down, reopened on idle passes
    Reconnecting,
}

/// Port statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortStats {
    /// Port name
    pub port: String,
    /// Lifecycle state
    pub state: PortState,
    /// Whether the transport is open
    pub connected: bool,
    /// When the worker was last started
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since start, 0 when stopped
    pub uptime_secs: f64,
    /// Registered device ids, sorted
    pub registered_devices: Vec<String>,
    /// Device number to device id
    pub device_numbers: BTreeMap<u8, String>,
    /// Commands written to the transport
    pub commands_processed: u64,
    /// Commands abandoned after exhausting retries (or dropped at stop)
    pub commands_failed: u64,
    /// Individual failed execution attempts, including retried ones
    pub failed_attempts: u64,
    /// Percentage of finished commands that were processed
    pub success_rate: f64,
    /// Replies delivered to their command
    pub responses_matched: u64,
    /// Replies that never arrived
    pub responses_timeout: u64,
    /// Replies shorter than expected
    pub responses_malformed: u64,
    /// Replies currently awaited
    pub pending_responses: usize,
    /// Queued entries
    pub queue_depth: usize,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Connects tried, successful or not
    pub connection_attempts: u64,
}

#[derive(Default)]
struct PortCounters {
    commands_processed: AtomicU64,
    commands_failed: AtomicU64,
    failed_attempts: AtomicU64,
    responses_malformed: AtomicU64,
    connection_attempts: AtomicU64,
}

/// State shared between the worker thread and handles
struct PortShared {
    port_name: String,
    config: BusConfig,
    queue: CommandQueue,
    correlator: ResponseCorrelator,
    registry: DeviceRegistry,
    state: Mutex<PortState>,
    connected: AtomicBool,
    running: AtomicBool,
    /// Parked here while no worker thread owns it
    connector: Mutex<Option<Box<dyn Connector>>>,
    counters: PortCounters,
    last_error: Mutex<Option<String>>,
    started: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PortShared {
    fn set_state(&self, state: PortState) {
        *lock(&self.state) = state;
    }

    fn record_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }

    /// Abandon a command that will never be attempted again
    fn fail_command(&self, command: Command) {
        self.counters.commands_failed.fetch_add(1, Ordering::Relaxed);
        command.complete(None);
    }
}

/// Owner of one physical port and its worker thread
pub struct PortWorker {
    shared: Arc<PortShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PortWorker {
    /// Create a stopped worker for `port_name`
    pub fn new(
        port_name: impl Into<String>,
        connector: Box<dyn Connector>,
        config: BusConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PortShared {
                port_name: port_name.into(),
                config,
                queue: CommandQueue::new(),
                correlator: ResponseCorrelator::new(),
                registry: DeviceRegistry::new(),
                state: Mutex::new(PortState::Stopped),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                connector: Mutex::new(Some(connector)),
                counters: PortCounters::default(),
                last_error: Mutex::new(None),
                started: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Name of the port this worker owns
    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    /// Bus settings
    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Launch the worker thread. Connection failures do not prevent starting.
    pub fn start(&self) -> Result<(), BusError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }
        // A detached worker hands the connector back only once it has exited
        let connector = lock(&self.shared.connector)
            .take()
            .ok_or_else(|| BusError::WorkerUnavailable(self.shared.port_name.clone()))?;

        let shared = self.shared.clone();
        shared.set_state(PortState::Connecting);
        shared.running.store(true, Ordering::SeqCst);
        *lock(&shared.started) = Some((Instant::now(), Utc::now()));
        shared.queue.open();

        let worker = WorkerLoop {
            shared: shared.clone(),
            connector,
            channel: None,
            reconnect_failures: 0,
            last_housekeeping: Instant::now(),
        };
        let spawned = thread::Builder::new()
            .name(format!("servobus:{}", shared.port_name))
            .spawn(move || worker.run());

        match spawned {
            Ok(join) => {
                info!(port = %shared.port_name, "port worker started");
                *handle = Some(join);
                Ok(())
            }
            Err(e) => {
                // The connector moved into the closure and is gone with it
                shared.running.store(false, Ordering::SeqCst);
                shared.queue.close();
                shared.set_state(PortState::Stopped);
                Err(BusError::Protocol(ProtocolError::IoError(e)))
            }
        }
    }

    /// Stop the worker: queue the stop sentinel, wait (bounded) for the thread,
    /// then fail whatever is still queued or pending.
    ///
    /// A thread that does not exit in time is detached. It leaves its loop as
    /// soon as its current command finishes, closes the transport and parks
    /// the connector so the port can be started again.
    pub fn stop(&self) {
        let Some(join) = lock(&self.handle).take() else {
            return;
        };
        let shared = &self.shared;
        shared.running.store(false, Ordering::SeqCst);
        shared.queue.push_shutdown();

        if join.thread().id() == thread::current().id() {
            // Called from a callback on the worker itself
            debug!(port = %shared.port_name, "stop requested from worker thread");
        } else {
            let deadline = Instant::now() + shared.config.stop_join_timeout();
            while !join.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if join.is_finished() {
                if join.join().is_err() {
                    warn!(port = %shared.port_name, "port worker panicked");
                }
            } else {
                warn!(
                    port = %shared.port_name,
                    "port worker did not exit in time, detaching"
                );
            }
        }

        let leftover = shared.queue.close();
        let pending = shared.correlator.drain();
        if !leftover.is_empty() || !pending.is_empty() {
            debug!(
                port = %shared.port_name,
                queued = leftover.len(),
                pending = pending.len(),
                "failing unfinished commands at stop"
            );
        }
        for command in leftover.into_iter().chain(pending) {
            shared.fail_command(command);
        }

        shared.connected.store(false, Ordering::SeqCst);
        shared.set_state(PortState::Stopped);
        *lock(&shared.started) = None;
        info!(port = %shared.port_name, "port worker stopped");
    }

    /// Queue a command for execution.
    ///
    /// If the worker is not running the command's callback fires immediately
    /// with `None`.
    pub fn submit(&self, command: Command) -> Result<(), BusError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            command.complete(None);
            return Err(BusError::NotRunning);
        }
        self.shared.queue.push(command).map_err(|(err, command)| {
            command.complete(None);
            err
        })
    }

    /// Whether the worker accepts commands
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the transport is open
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> PortState {
        *lock(&self.shared.state)
    }

    /// Devices registered on this port
    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    /// Replies currently awaited
    pub fn pending_responses(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Whether a reply for `id` is still awaited
    pub fn is_pending(&self, id: CommandId) -> bool {
        self.shared.correlator.contains(id)
    }

    /// Queued entries
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PortStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        let connected = self.is_connected();
        let registry = shared.registry.stats(connected);
        let processed = counters.commands_processed.load(Ordering::Relaxed);
        let failed = counters.commands_failed.load(Ordering::Relaxed);
        let finished = processed + failed;
        let success_rate = if finished == 0 {
            100.0
        } else {
            processed as f64 / finished as f64 * 100.0
        };
        let started = *lock(&shared.started);

        PortStats {
            port: shared.port_name.clone(),
            state: self.state(),
            connected,
            started_at: started.map(|(_, at)| at),
            uptime_secs: started
                .map(|(at, _)| at.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            registered_devices: registry.devices,
            device_numbers: registry.device_numbers,
            commands_processed: processed,
            commands_failed: failed,
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            success_rate,
            responses_matched: shared.correlator.matched(),
            responses_timeout: shared.correlator.timed_out(),
            responses_malformed: counters.responses_malformed.load(Ordering::Relaxed),
            pending_responses: shared.correlator.pending_count(),
            queue_depth: shared.queue.len(),
            last_error: lock(&shared.last_error).clone(),
            connection_attempts: counters.connection_attempts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PortWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the worker thread
struct WorkerLoop {
    shared: Arc<PortShared>,
    connector: Box<dyn Connector>,
    channel: Option<Box<dyn Channel>>,
    reconnect_failures: u32,
    last_housekeeping: Instant,
}

impl WorkerLoop {
    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        let poll = self.shared.config.poll_interval();
        let delay = self.shared.config.inter_command_delay();

        if self.is_running() {
            self.connect();
        }

        while self.is_running() {
            match self.shared.queue.pop(poll) {
                None => self.housekeeping(),
                Some(QueueEntry::Shutdown) => break,
                Some(QueueEntry::Execute(command)) if !self.is_running() => {
                    self.shared.fail_command(command);
                    break;
                }
                Some(QueueEntry::Execute(command)) => {
                    self.execute(command);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    if self.last_housekeeping.elapsed() >= poll {
                        self.housekeeping();
                    }
                }
            }
        }

        self.disconnect();
        debug!(port = %self.shared.port_name, "worker loop exited");
        *lock(&self.shared.connector) = Some(self.connector);
    }

    fn connect(&mut self) {
        let shared = &self.shared;
        shared
            .counters
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);

        match self.connector.connect() {
            Ok(channel) => {
                self.channel = Some(channel);
                shared.connected.store(true, Ordering::SeqCst);
                shared.set_state(PortState::Running);
                info!(
                    port = %shared.port_name,
                    transport = %self.connector.describe(),
                    "connected"
                );
                self.reconnect_failures = 0;
            }
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                shared.set_state(PortState::Reconnecting);
                shared.record_error(format!("connect failed: {}", e));
                if self.reconnect_failures == 0 {
                    warn!(port = %shared.port_name, error = %e, "connect failed, will retry when idle");
                } else {
                    debug!(
                        port = %shared.port_name,
                        error = %e,
                        failures = self.reconnect_failures,
                        "reconnect failed"
                    );
                }
                self.reconnect_failures = self.reconnect_failures.saturating_add(1);
            }
        }
    }

    fn disconnect(&mut self) {
        if self.channel.take().is_some() {
            debug!(port = %self.shared.port_name, "transport closed");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    fn housekeeping(&mut self) {
        self.last_housekeeping = Instant::now();
        self.shared.correlator.sweep(Instant::now());
        if self.channel.is_none() && self.is_running() {
            self.connect();
        }
    }

    fn execute(&mut self, mut command: Command) {
        command.attempts += 1;
        if self.channel.is_none() {
            // Housekeeping reopens the transport; only the first miss is free
            if command.attempts == 1 {
                self.record_failed_attempt(&command, &ProtocolError::NotConnected);
                debug!(
                    port = %self.shared.port_name,
                    command_id = command.id,
                    "not connected, requeued without using a retry"
                );
                self.requeue(command);
            } else {
                self.handle_failure(command, ProtocolError::NotConnected);
            }
            return;
        }

        let frame = match encode(command.device_number, &command.kind) {
            Ok(frame) => frame,
            Err(e) => {
                // Nothing a retry could fix
                warn!(
                    port = %self.shared.port_name,
                    command_id = command.id,
                    error = %e,
                    "cannot encode command"
                );
                self.shared.record_error(e.to_string());
                self.shared.fail_command(command);
                return;
            }
        };

        debug!(
            port = %self.shared.port_name,
            command_id = command.id,
            device_number = command.device_number,
            kind = command.kind.name(),
            priority = %command.priority,
            attempt = command.attempts,
            "executing"
        );

        if !command.expects_response {
            match self.write_frame(&frame) {
                Ok(()) => command.complete(Some(Response::Ack)),
                Err(e) => self.handle_failure(command, e),
            }
            return;
        }

        let kind = command.kind;
        let timeout = command.timeout;
        let id = match self.shared.correlator.register(command, Instant::now()) {
            Ok(id) => id,
            Err(command) => {
                command.complete(Some(Response::Ack));
                return;
            }
        };

        let reply = self
            .write_frame(&frame)
            .and_then(|()| self.read(kind.response_len(), timeout));

        match reply {
            Ok(bytes) if bytes.is_empty() => {
                // No answer: the sweep times it out
                debug!(port = %self.shared.port_name, command_id = id, "no reply");
                self.shared.correlator.sweep(Instant::now());
            }
            Ok(bytes) => {
                let value = decode_response(&kind, &bytes);
                if value.is_none() {
                    self.shared
                        .counters
                        .responses_malformed
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        port = %self.shared.port_name,
                        command_id = id,
                        received = bytes.len(),
                        expected = kind.response_len(),
                        "short reply"
                    );
                }
                self.shared.correlator.resolve(id, value);
            }
            Err(e) => {
                if let Some(command) = self.shared.correlator.withdraw(id) {
                    self.handle_failure(command, e);
                }
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        let channel = self.channel.as_mut().ok_or(ProtocolError::NotConnected)?;
        if let Err(e) = channel.clear_input_buffer() {
            debug!(port = %self.shared.port_name, error = %e, "clear input failed");
        }
        channel.write_all(frame)?;
        channel.flush()?;
        self.shared
            .counters
            .commands_processed
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let channel = self.channel.as_mut().ok_or(ProtocolError::NotConnected)?;
        read_reply(channel.as_mut(), len, timeout)
    }

    fn record_failed_attempt(&self, command: &Command, error: &ProtocolError) {
        self.shared
            .counters
            .failed_attempts
            .fetch_add(1, Ordering::Relaxed);
        self.shared.record_error(format!(
            "{} for device {}: {}",
            command.kind.name(),
            command.device_number,
            error
        ));
    }

    /// Put a command back in its original place, or fail it if the queue closed
    fn requeue(&self, command: Command) {
        if let Err((_, command)) = self.shared.queue.push(command) {
            self.shared.fail_command(command);
        }
    }

    /// Count a failed attempt and retry or abandon the command
    fn handle_failure(&mut self, mut command: Command, error: ProtocolError) {
        let shared = self.shared.clone();
        self.record_failed_attempt(&command, &error);

        if error.is_transport_lost() && self.channel.is_some() {
            warn!(port = %shared.port_name, error = %error, "transport lost");
            self.disconnect();
            if self.is_running() {
                shared.set_state(PortState::Reconnecting);
            }
        }

        if command.can_retry() {
            command.retry_count += 1;
            debug!(
                port = %shared.port_name,
                command_id = command.id,
                retry = command.retry_count,
                max_retries = command.max_retries,
                error = %error,
                "retrying command"
            );
            self.requeue(command);
        } else {
            warn!(
                port = %shared.port_name,
                command_id = command.id,
                device_number = command.device_number,
                kind = command.kind.name(),
                attempts = command.attempts,
                error = %error,
                "command abandoned"
            );
            shared.fail_command(command);
        }
    }
}
