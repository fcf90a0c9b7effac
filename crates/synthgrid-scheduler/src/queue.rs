//! Bounded FIFO wait queue.
//!
//! Holds requests that passed rate limiting but did not fit in the budget.
//! Dequeue order is strict arrival order with no priority reordering. Each
//! entry carries its own queue deadline; [`WaitQueue::evict_expired`] removes
//! every entry whose deadline has passed, in arrival order.

use std::collections::VecDeque;

use tokio::time::Instant;

use synthgrid_core::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: RequestId,
    pub cost: u32,
    /// Arrival sequence number, strictly increasing.
    pub seq: u64,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

impl QueueEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// The queue was at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

#[derive(Debug)]
pub struct WaitQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    next_seq: u64,
}

impl WaitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    /// Append at the tail, or fail immediately if the queue is full.
    pub fn enqueue(
        &mut self,
        id: RequestId,
        cost: u32,
        now: Instant,
        deadline: Instant,
    ) -> Result<u64, QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(QueueEntry {
            id,
            cost,
            seq,
            enqueued_at: now,
            deadline,
        });
        Ok(seq)
    }

    pub fn peek_head(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub fn pop_head(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Remove a specific entry (cancellation).
    pub fn remove(&mut self, id: RequestId) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos)
    }

    /// Remove all entries whose deadline has passed, oldest first.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<QueueEntry> {
        if !self.entries.iter().any(|e| e.is_expired(now)) {
            return Vec::new();
        }
        let mut expired = Vec::new();
        self.entries.retain(|e| {
            if e.is_expired(now) {
                expired.push(*e);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Earliest deadline among waiting entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
