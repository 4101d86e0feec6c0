//! Performance counters for external health checks.
//!
//! Process-wide counters mutated by the capture path and by concurrently
//! completing dispatch tasks. All fields are atomics so flush completions
//! never lose updates to each other; [`PerfCounters::snapshot`] gives a
//! consistent read for the outside world.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, mutated only from inside the engine.
#[derive(Debug, Default)]
pub struct PerfCounters {
    events_captured: AtomicU64,
    events_sent: AtomicU64,
    flushes: AtomicU64,
    errors: AtomicU64,
    pending_events: AtomicU64,
    last_flush_unix: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// One event captured and queued.
    pub fn event_captured(&self) {
        self.events_captured.fetch_add(1, Ordering::Relaxed);
        self.pending_events.fetch_add(1, Ordering::Relaxed);
    }

    /// The queue was drained for a flush.
    pub fn queue_drained(&self) {
        self.pending_events.store(0, Ordering::Relaxed);
    }

    /// A batch of `count` events was delivered.
    pub fn batch_sent(&self, count: u64, now_unix: i64) {
        self.events_sent.fetch_add(count, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.last_flush_unix
            .store(now_unix.max(0) as u64, Ordering::Relaxed);
    }

    /// A dispatch attempt failed; its events are lost.
    pub fn batch_failed(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter at one instant.
    pub fn snapshot(&self) -> PerfStats {
        let last = self.last_flush_unix.load(Ordering::Relaxed);
        PerfStats {
            events_captured: self.events_captured.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pending_events: self.pending_events.load(Ordering::Relaxed),
            last_flush_unix: if last == 0 { None } else { Some(last as i64) },
        }
    }
}

/// A point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerfStats {
    /// Total events captured since init
    pub events_captured: u64,

    /// Total events successfully delivered
    pub events_sent: u64,

    /// Number of batches successfully delivered
    pub flushes: u64,

    /// Number of failed dispatch attempts
    pub errors: u64,

    /// Events currently waiting in the queue
    pub pending_events: u64,

    /// Unix time of the last successful flush, if any
    pub last_flush_unix: Option<i64>,
}
