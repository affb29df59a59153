#![no_std]

/// Compile-time size of both maps. The loader overrides it from the
/// configured table capacity before the maps are created.
pub const DEFAULT_MAX_ENTRIES: u32 = 2;

/// Slot of the socket that a slot is spliced to.
///
/// Slots `2k` and `2k + 1` form one pair.
#[inline(always)]
pub const fn peer_slot(index: u32) -> u32 {
    index ^ 1
}
