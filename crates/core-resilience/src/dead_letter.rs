//! Dead-Letter Queue: Bounded side channel for unprocessable items
//!
//! Items that can never be processed (permanent failures, delivery count
//! exhausted) are parked here with a reason and description instead of being
//! discarded, so they can be inspected offline.
//!
//! # Design
//!
//! The queue is an in-memory ring with a fixed capacity. When full, the
//! oldest entry is dropped and counted. Callers that need durability drain it
//! into their own store.
//!
//! # Example
//!
//! ```
//! use pump_core_resilience::dead_letter::{DeadLetterQueue, DeadLetterEntry};
//!
//! let mut dlq = DeadLetterQueue::new(1000);
//!
//! dlq.push(DeadLetterEntry::new(
//!     "msg-42",
//!     "payload",
//!     "RelayFailed",
//!     "destination rejected message",
//! ));
//!
//! assert_eq!(dlq.len(), 1);
//! assert!(dlq.contains_key("msg-42"));
//! let entries = dlq.drain();
//! assert_eq!(entries[0].item, "payload");
//! ```

use std::collections::VecDeque;
use std::time::SystemTime;

use tracing::warn;

/// A single dead-lettered item
#[derive(Debug, Clone)]
pub struct DeadLetterEntry<T> {
    /// Identifier of the item, usually a message id
    pub item_key: String,

    /// The parked item itself
    pub item: T,

    /// Short machine-readable reason
    pub reason: String,

    /// Human-readable description
    pub description: String,

    /// When the item was dead-lettered
    pub dead_lettered_at: SystemTime,
}

impl<T> DeadLetterEntry<T> {
    /// Build an entry stamped with the current time
    pub fn new(
        item_key: impl Into<String>,
        item: T,
        reason: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            item_key: item_key.into(),
            item,
            reason: reason.into(),
            description: description.into(),
            dead_lettered_at: SystemTime::now(),
        }
    }
}

/// In-memory dead-letter queue with bounded capacity.
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    entries: VecDeque<DeadLetterEntry<T>>,
    max_capacity: usize,
    total_received: u64,
    total_dropped: u64,
}

impl<T> DeadLetterQueue<T> {
    /// Create a new dead-letter queue with the given maximum capacity
    pub fn new(max_capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_capacity.min(1024)),
            max_capacity,
            total_received: 0,
            total_dropped: 0,
        }
    }

    /// Push an entry, dropping the oldest one if the queue is full
    pub fn push(&mut self, entry: DeadLetterEntry<T>) {
        self.total_received += 1;

        if self.max_capacity == 0 {
            self.total_dropped += 1;
            warn!(
                item_key = %entry.item_key,
                reason = %entry.reason,
                "Dead-letter queue has no capacity, dropping entry"
            );
            return;
        }

        if self.entries.len() >= self.max_capacity {
            if let Some(dropped) = self.entries.pop_front() {
                self.total_dropped += 1;
                warn!(
                    item_key = %dropped.item_key,
                    reason = %dropped.reason,
                    max_capacity = self.max_capacity,
                    total_dropped = self.total_dropped,
                    "Dead-letter queue full, dropping oldest entry"
                );
            }
        }

        self.entries.push_back(entry);
    }

    /// Remove and return every entry
    pub fn drain(&mut self) -> Vec<DeadLetterEntry<T>> {
        self.entries.drain(..).collect()
    }

    /// Peek at all entries without removing them
    pub fn entries(&self) -> &VecDeque<DeadLetterEntry<T>> {
        &self.entries
    }

    /// Whether an entry with this key is currently held
    pub fn contains_key(&self, item_key: &str) -> bool {
        self.entries.iter().any(|e| e.item_key == item_key)
    }

    /// Entries with the given key, oldest first
    pub fn entries_for_key(&self, item_key: &str) -> Vec<&DeadLetterEntry<T>> {
        self.entries
            .iter()
            .filter(|e| e.item_key == item_key)
            .collect()
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            current_count: self.entries.len(),
            max_capacity: self.max_capacity,
            total_received: self.total_received,
            total_dropped: self.total_dropped,
        }
    }
}

/// Statistics for the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterStats {
    /// Current number of entries
    pub current_count: usize,
    /// Maximum capacity
    pub max_capacity: usize,
    /// Total entries ever received
    pub total_received: u64,
    /// Total entries dropped due to capacity overflow
    pub total_dropped: u64,
}
