//! Tracks the ids of currently active rounds for timeout supervision and
//! graceful shutdown.

use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Default)]
pub struct RoundTracker {
    active: Mutex<HashSet<u64>>,
}

impl RoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, round_id: u64) {
        self.active.lock().insert(round_id);
    }

    /// Remove a round; false when it was not tracked (already removed).
    pub fn remove(&self, round_id: u64) -> bool {
        self.active.lock().remove(&round_id)
    }

    pub fn contains(&self, round_id: u64) -> bool {
        self.active.lock().contains(&round_id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}
