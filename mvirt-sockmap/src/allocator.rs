//! Slot assignment for accepted connections.
//!
//! Consecutive connections are spliced together: a new connection first
//! fills a slot whose peer is already waiting, and only opens a new pair when
//! no half-filled pair exists.

use crate::index::{Capacity, SlotIndex};
use std::sync::Mutex;

pub struct PairAllocator {
    used: Mutex<Vec<bool>>,
}

impl PairAllocator {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            used: Mutex::new(vec![false; capacity.get() as usize]),
        }
    }

    /// Reserve a slot, or `None` if the table is full.
    pub fn acquire(&self) -> Option<SlotIndex> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());

        let waiting = (0..used.len()).find(|&i| !used[i] && used[i ^ 1]);
        let slot = waiting.or_else(|| used.iter().position(|u| !u))?;

        used[slot] = true;
        Some(SlotIndex::new(slot as u32))
    }

    /// Return a slot. Releasing a free or out-of-range slot is a no-op.
    pub fn release(&self, index: SlotIndex) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = used.get_mut(index.get() as usize) {
            *slot = false;
        }
    }

    /// Number of reserved slots.
    pub fn in_use(&self) -> usize {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.iter().filter(|u| **u).count()
    }
}
