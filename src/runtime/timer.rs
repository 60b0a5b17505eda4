//! Deadline queue for the event loop.
//!
//! Entries are never removed early. Idle entries are validated against
//! the connection's current deadline and generation when they fire, so
//! a rescheduled or closed connection simply discards the stale entry.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

/// What to do when a deadline is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Check the idle deadline of connection `conn_id`, provided its
    /// generation still matches.
    Idle { conn_id: usize, gen: u64 },
    /// A delayed handler reply is due.
    Task { task_id: usize },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    seq: u64,
    event: TimerEvent,
}

// Ordered by deadline, then insertion order; the event itself does not
// participate.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    pub fn schedule(&mut self, at: Instant, event: TimerEvent) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Entry { at, seq, event }));
    }

    /// The earliest outstanding deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.at)
    }

    /// Pop one event whose deadline has passed, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        if self.heap.peek().is_some_and(|Reverse(entry)| entry.at <= now) {
            self.heap.pop().map(|Reverse(entry)| entry.event)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
