//! Bounded, priority-ordered buffer for outbound messages.
//!
//! Messages that cannot be sent immediately wait here. The queue is kept
//! sorted by priority descending with FIFO order inside each priority band.
//! On overflow the oldest entry of the lowest-priority band is dropped
//! first, so with uniform priorities the queue behaves like a sliding
//! window over the most recent messages.

use std::time::Instant;

use serde_json::Value;
use tracing::warn;

/// Hard bound on buffered outbound messages.
pub const MAX_QUEUED_MESSAGES: usize = 1000;

/// One buffered outbound message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Opaque application payload; re-stamped with a fresh timestamp when
    /// the queue drains.
    pub payload: Value,
    /// Higher values drain first.
    pub priority: i32,
    /// When the message entered the queue.
    pub enqueued_at: Instant,
    seq: u64,
}

/// The outbound buffer.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: Vec<QueuedMessage>,
    next_seq: u64,
    capacity: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUED_MESSAGES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            capacity,
        }
    }

    /// Append a message and restore priority order. Returns how many entries
    /// overflow truncation dropped.
    pub fn enqueue(&mut self, payload: Value, priority: i32) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueuedMessage {
            payload,
            priority,
            enqueued_at: Instant::now(),
            seq,
        });
        self.restore_order();
        self.truncate_overflow()
    }

    /// Remove and return the head: highest priority, oldest within the band.
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Put a popped message back after a failed send. The original sequence
    /// number is preserved, so the message returns to its exact position and
    /// ordering is unaffected by the failed drain.
    pub fn requeue(&mut self, message: QueuedMessage) {
        self.entries.push(message);
        self.restore_order();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current contents in drain order.
    pub fn entries(&self) -> &[QueuedMessage] {
        &self.entries
    }

    fn restore_order(&mut self) {
        self.entries
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    fn truncate_overflow(&mut self) -> usize {
        let mut dropped = 0;
        while self.entries.len() > self.capacity {
            // The lowest-priority band is the sorted suffix; its oldest
            // entry sits at the band start.
            let min_priority = match self.entries.last() {
                Some(message) => message.priority,
                None => break,
            };
            let band_start = self
                .entries
                .partition_point(|message| message.priority > min_priority);
            self.entries.remove(band_start);
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                dropped,
                capacity = self.capacity,
                "Outbound queue overflow, dropped oldest low-priority messages"
            );
        }
        dropped
    }
}
