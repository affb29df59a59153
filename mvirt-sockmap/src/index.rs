//! Typed slot indices and table capacity.
//!
//! Slots are paired positionally: `2k` and `2k + 1` splice to each other.
//! The pairing is fixed by the index the caller registers at, the kernel
//! program never matches connections on its own.

use crate::error::{Result, SockmapError};
use std::fmt;

/// Index of a slot in the redirect table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The slot this one is spliced to.
    // Must match peer_slot() in mvirt-sockmap-programs.
    pub const fn peer(self) -> Self {
        Self(self.0 ^ 1)
    }

    /// Number of the pair this slot belongs to.
    pub const fn pair(self) -> u32 {
        self.0 / 2
    }

    /// Both slots of pair `pair`, even slot first.
    pub const fn slots_of_pair(pair: u32) -> (Self, Self) {
        (Self(pair * 2), Self(pair * 2 + 1))
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of slots in the redirect table. Always even and at least 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity(u32);

impl Capacity {
    pub fn new(slots: u32) -> Result<Self> {
        if slots < 2 || slots % 2 != 0 {
            return Err(SockmapError::InvalidCapacity(slots));
        }
        Ok(Self(slots))
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn pairs(self) -> u32 {
        self.0 / 2
    }

    pub fn check(self, index: SlotIndex) -> Result<()> {
        if index.get() >= self.0 {
            return Err(SockmapError::InvalidIndex {
                index: index.get(),
                capacity: self.0,
            });
        }
        Ok(())
    }

    /// All slot indices, in order.
    pub fn slots(self) -> impl Iterator<Item = SlotIndex> {
        (0..self.0).map(SlotIndex)
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
