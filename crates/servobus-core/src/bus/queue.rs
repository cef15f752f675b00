//! Command queue
//!
//! Priority-ordered queue drained by the port worker. Many threads push; one
//! worker pops, blocking for at most a poll interval so it can run
//! housekeeping while idle.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::command::{next_sequence, Command, Priority};
use super::BusError;

/// What the worker receives from the queue
#[derive(Debug)]
pub enum QueueEntry {
    /// A command to execute
    Execute(Command),
    /// Stop sentinel: exit the worker loop
    Shutdown,
}

/// Heap item; ordered so the most urgent, oldest entry is the heap maximum
#[derive(Debug)]
struct QueueItem {
    priority: Priority,
    sequence: u64,
    entry: QueueEntry,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so lower (priority, sequence) wins
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueItem>,
    open: bool,
}

/// Command queue with priority support
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    /// Create a closed queue; pushes fail until [`CommandQueue::open`]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                open: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting commands
    pub fn open(&self) {
        self.lock().open = true;
    }

    /// Whether pushes are accepted
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Enqueue a command.
    ///
    /// On failure the command is handed back so the caller can complete it.
    pub fn push(&self, command: Command) -> Result<(), (BusError, Command)> {
        let mut inner = self.lock();
        if !inner.open {
            return Err((BusError::NotRunning, command));
        }
        inner.heap.push(QueueItem {
            priority: command.priority,
            sequence: command.sequence,
            entry: QueueEntry::Execute(command),
        });
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Enqueue the stop sentinel at emergency priority.
    ///
    /// The sentinel sorts behind emergency commands created before it but ahead
    /// of everything else. It is accepted even when the queue is closed.
    pub fn push_shutdown(&self) {
        let mut inner = self.lock();
        inner.heap.push(QueueItem {
            priority: Priority::Emergency,
            sequence: next_sequence(),
            entry: QueueEntry::Shutdown,
        });
        drop(inner);
        self.available.notify_all();
    }

    /// Remove the most urgent entry, waiting up to `timeout` for one to arrive
    pub fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.heap.pop() {
                return Some(item.entry);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// Stop accepting commands and return everything still queued, in order
    pub fn close(&self) -> Vec<Command> {
        let mut inner = self.lock();
        inner.open = false;
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(item) = inner.heap.pop() {
            if let QueueEntry::Execute(command) = item.entry {
                drained.push(command);
            }
        }
        drained
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }
}
