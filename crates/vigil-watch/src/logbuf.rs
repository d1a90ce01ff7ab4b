//! Bounded per-watcher log buffer with live subscriptions.
//!
//! Keeps the most recent entries in a FIFO ring and fans each appended entry
//! out to live subscribers. Subscribing snapshots the buffer and registers
//! the subscriber in one step, so a consumer sees every buffered entry
//! exactly once followed by live entries with no gap or duplicate.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use vigil_types::LogEntry;

/// Ring buffer of recent log entries plus live subscriber queues.
///
/// Callers serialize access externally (the orchestrator holds it behind a
/// mutex), which is what makes the snapshot-then-subscribe atomic.
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<LogEntry>>,
}

impl LogBuffer {
    /// Create a buffer retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            subscribers: Vec::new(),
        }
    }

    /// Append an entry, evicting the oldest if the buffer is full, and offer
    /// it to every live subscriber. Subscribers that went away are dropped.
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        self.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
    }

    /// The buffered entries, optionally tail-limited to the most recent `limit`.
    pub fn entries(&self, limit: Option<usize>) -> Vec<LogEntry> {
        match limit {
            Some(n) => {
                let start = self.entries.len().saturating_sub(n);
                self.entries.range(start..).cloned().collect()
            }
            None => self.entries.iter().cloned().collect(),
        }
    }

    /// Snapshot the buffer and register a live subscriber in one step.
    pub fn subscribe(&mut self) -> LogStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog: VecDeque<LogEntry> = self.entries.iter().cloned().collect();
        self.subscribers.push(tx);
        LogStream { backlog, rx }
    }

    /// Drop all subscriber queues; their streams end after draining.
    pub fn close(&mut self) {
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A log stream that replays the buffered backlog, then continues live.
pub struct LogStream {
    backlog: VecDeque<LogEntry>,
    rx: mpsc::UnboundedReceiver<LogEntry>,
}

impl LogStream {
    /// Next entry: backlog first, then live. `None` once the buffer is
    /// closed and everything has been drained.
    pub async fn next(&mut self) -> Option<LogEntry> {
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant used by consumers polling on their own schedule.
    pub fn try_next(&mut self) -> Option<LogEntry> {
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry);
        }
        self.rx.try_recv().ok()
    }
}
