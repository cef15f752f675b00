//! Bus commands
//!
//! A [`Command`] is one requested operation for one logical device. It owns
//! its completion callback, so whoever holds the command is the only party
//! that can complete it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::protocol::{CommandKind, Response, DEFAULT_TIMEOUT_MS};

/// Default number of retries after the first failed attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Next value of the process-wide submission sequence
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Unique command identifier
pub type CommandId = u64;

/// Completion callback. Receives the decoded reply (or [`Response::Ack`] for
/// write-only commands), or `None` on permanent failure or timeout.
///
/// Runs on the port worker thread and must not block.
pub type ResponseCallback = Box<dyn FnOnce(Option<Response>) + Send + 'static>;

/// Command urgency. Lower numeric value is more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    /// Safety-critical, e.g. emergency stop
    Emergency = 1,
    /// Motion the caller is waiting on
    Realtime = 2,
    /// Default for ordinary commands
    #[default]
    Normal = 3,
    /// Status polling
    Low = 4,
    /// Runs only when nothing else is queued
    Background = 5,
}

impl Priority {
    /// Every level, most urgent first
    pub const ALL: [Priority; 5] = [
        Priority::Emergency,
        Priority::Realtime,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric level (1 = most urgent)
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Lowercase name, as used in config and JSON
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::Realtime => "realtime",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(Priority::Emergency),
            "realtime" => Ok(Priority::Realtime),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// One requested bus operation
pub struct Command {
    /// Unique id, used to correlate replies
    pub id: CommandId,
    /// Logical owner
    pub device_id: String,
    /// Wire address
    pub device_number: u8,
    /// Operation and its parameters
    pub kind: CommandKind,
    /// Queue band
    pub priority: Priority,
    /// Monotonic submission order, tiebreak within a priority band
    pub sequence: u64,
    /// Creation time
    pub submitted_at: Instant,
    /// Whether the device answers this command
    pub expects_response: bool,
    /// How long to wait for a reply
    pub timeout: Duration,
    /// Failed attempts counted against `max_retries`
    pub retry_count: u32,
    /// Times the worker picked the command up
    pub attempts: u32,
    /// Retries allowed after the first counted failure
    pub max_retries: u32,
    callback: Option<ResponseCallback>,
}

impl Command {
    /// Create a command with a fresh id and sequence number
    pub fn new(
        device_id: impl Into<String>,
        device_number: u8,
        kind: CommandKind,
        priority: Priority,
    ) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            device_id: device_id.into(),
            device_number,
            kind,
            priority,
            sequence: next_sequence(),
            submitted_at: Instant::now(),
            expects_response: kind.expects_response(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry_count: 0,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            callback: None,
        }
    }

    /// Attach the completion callback
    pub fn with_callback(mut self, callback: impl FnOnce(Option<Response>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Override the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether a callback is still attached
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Queue ordering key: priority ascending, then submission order ascending
    pub fn order_key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }

    /// Whether another attempt is allowed after the current failure count
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Finish the command, invoking its callback (if any) with `value`.
    ///
    /// Consumes the command, so a command completes at most once.
    pub fn complete(mut self, value: Option<Response>) {
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

impl Drop for Command {
    // A command lost without completion (detached worker) still reports failure
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(None);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("device_number", &self.device_number)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("retry_count", &self.retry_count)
            .field("attempts", &self.attempts)
            .field("max_retries", &self.max_retries)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
