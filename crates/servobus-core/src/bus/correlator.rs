//! Response correlator
//!
//! Holds commands that are waiting for a reply, keyed by command id. Every
//! entry leaves the map exactly once: matched, withdrawn for a retry, timed out
//! by a sweep, or drained at shutdown. Callbacks run after the map lock is
//! released so they may submit new commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::command::{Command, CommandId};
use crate::protocol::Response;

/// A command in flight
#[derive(Debug)]
pub struct PendingResponse {
    /// The command awaiting its reply
    pub command: Command,
    /// When the wait started
    pub start_time: Instant,
}

/// Tracks in-flight commands awaiting a reply
#[derive(Default)]
pub struct ResponseCorrelator {
    pending: Mutex<HashMap<CommandId, PendingResponse>>,
    matched: AtomicU64,
    timed_out: AtomicU64,
}

impl ResponseCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CommandId, PendingResponse>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a command.
    ///
    /// Commands that expect no reply are handed straight back.
    pub fn register(&self, command: Command, start_time: Instant) -> Result<CommandId, Command> {
        if !command.expects_response {
            return Err(command);
        }
        let id = command.id;
        let previous = self.lock().insert(
            id,
            PendingResponse {
                command,
                start_time,
            },
        );
        if let Some(previous) = previous {
            // Ids are unique; a collision means a command was registered twice
            tracing::warn!(command_id = id, "duplicate pending response replaced");
            previous.command.complete(None);
        }
        Ok(id)
    }

    /// Complete a pending command with `value`. Returns false if the id is
    /// not pending (already matched or timed out).
    pub fn resolve(&self, id: CommandId, value: Option<Response>) -> bool {
        let entry = self.lock().remove(&id);
        match entry {
            Some(pending) => {
                if value.is_some() {
                    self.matched.fetch_add(1, Ordering::Relaxed);
                }
                pending.command.complete(value);
                true
            }
            None => false,
        }
    }

    /// Take a command back without completing it (used for retries)
    pub fn withdraw(&self, id: CommandId) -> Option<Command> {
        self.lock().remove(&id).map(|pending| pending.command)
    }

    /// Time out every entry older than its command's timeout.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingResponse> = {
            let mut pending = self.lock();
            let ids: Vec<CommandId> = pending
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.start_time) > p.command.timeout)
                .map(|(id, _)| *id)
                .collect();
            let expired: Vec<PendingResponse> =
                ids.iter().filter_map(|id| pending.remove(id)).collect();
            self.timed_out
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            expired
        };

        let count = expired.len();
        for pending in expired {
            tracing::debug!(
                command_id = pending.command.id,
                device_number = pending.command.device_number,
                kind = pending.command.kind.name(),
                "response timed out"
            );
            pending.command.complete(None);
        }
        count
    }

    /// Remove every entry (shutdown). Callers complete the returned commands.
    pub fn drain(&self) -> Vec<Command> {
        self.lock().drain().map(|(_, p)| p.command).collect()
    }

    /// Number of replies still awaited
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether a reply for `id` is still awaited
    pub fn contains(&self, id: CommandId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Replies matched to a pending command
    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Entries removed by a sweep
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }
}
