//! The in-memory event queue.
//!
//! An ordered, append-only buffer of captured events awaiting transmission.
//! Insertion order is preserved so a batch transmits events in capture
//! order. The queue is drained atomically at flush time — draining before
//! any asynchronous work begins is what guarantees no event ever appears
//! in two batches.

use crate::event::Event;

/// Ordered buffer of events awaiting the next flush.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<Event>,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Append an event, returning the new queue length.
    pub fn push(&mut self, event: Event) -> usize {
        self.events.push(event);
        self.events.len()
    }

    /// Current number of queued events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Take every queued event, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}
