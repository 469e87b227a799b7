//! Overflow ring buffer for block events.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::BlockEvent;

/// Fixed-capacity ring buffer that overwrites the oldest event when full.
///
/// Callers never block: a push into a full buffer evicts the oldest entry
/// and reports the eviction so the shipper can count it as a drop.
pub struct RingBuffer {
    entries: Mutex<VecDeque<BlockEvent>>,
    capacity: usize,
}

impl RingBuffer {
    /// Creates a ring buffer holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    /// Adds an event, evicting the oldest one when the buffer is full.
    ///
    /// Returns `true` if an event was evicted.
    pub fn push(&self, event: BlockEvent) -> bool {
        let mut entries = self.entries.lock();
        let evicted = entries.len() >= self.capacity;
        if evicted {
            entries.pop_front();
        }
        entries.push_back(event);
        evicted
    }

    /// Removes and returns up to `max` events, oldest first.
    #[must_use]
    pub fn drain(&self, max: usize) -> Vec<BlockEvent> {
        let mut entries = self.entries.lock();
        let count = max.min(entries.len());
        entries.drain(..count).collect()
    }

    /// Removes and returns all buffered events, oldest first.
    #[must_use]
    pub fn drain_all(&self) -> Vec<BlockEvent> {
        self.entries.lock().drain(..).collect()
    }

    /// Current number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
