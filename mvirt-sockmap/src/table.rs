//! Kernel descriptor table backing the redirect lookups.
//!
//! Two maps live in the kernel: `SOCKMAP` holds the spliced sockets by slot,
//! and `SOCK_INDEX` maps each socket's cookie back to its slot so the verdict
//! program can find the peer of the socket that received data. A userspace
//! mirror of the slot occupants lets us evict stale `SOCK_INDEX` entries.

use crate::descriptor::{SocketCookie, validate_stream_socket};
use crate::error::{Result, SockmapError, os_error};
use crate::index::{Capacity, SlotIndex};
use aya::Bpf;
use aya::maps::{HashMap, MapData, MapError, SockMap};
use std::os::fd::AsFd;
use tracing::{debug, info, warn};

/// Map names (must match mvirt-sockmap-programs)
pub const SOCKMAP: &str = "SOCKMAP";
pub const SOCK_INDEX: &str = "SOCK_INDEX";

/// Entries in `SOCK_INDEX`. Overwriting a slot of a full table inserts the
/// new cookie before the evicted one is removed, so one slot is not enough.
pub(crate) fn index_entries(capacity: Capacity) -> u32 {
    capacity.get().saturating_mul(2)
}

/// Fixed-capacity table of socket descriptors, addressable by slot index.
pub struct DescriptorTable {
    capacity: Capacity,
    sockets: SockMap<MapData>,
    index: HashMap<MapData, u64, u32>,
    slots: Vec<Option<SocketCookie>>,
}

impl DescriptorTable {
    /// Take ownership of the table maps from a loaded BPF object.
    ///
    /// The maps are created in the kernel when the object is loaded, sized
    /// by the loader to `capacity`.
    pub fn create(bpf: &mut Bpf, capacity: Capacity) -> Result<Self> {
        let sockets = bpf
            .take_map(SOCKMAP)
            .ok_or_else(|| SockmapError::exhausted(format!("map {SOCKMAP} not found")))?;
        let sockets = SockMap::try_from(sockets).map_err(|e| SockmapError::ResourceExhausted {
            context: format!("map {SOCKMAP} unusable"),
            source: Some(e),
        })?;

        let index = bpf
            .take_map(SOCK_INDEX)
            .ok_or_else(|| SockmapError::exhausted(format!("map {SOCK_INDEX} not found")))?;
        let index = HashMap::try_from(index).map_err(|e| SockmapError::ResourceExhausted {
            context: format!("map {SOCK_INDEX} unusable"),
            source: Some(e),
        })?;

        info!(capacity = %capacity, "Descriptor table created");

        Ok(Self::from_maps(sockets, index, capacity))
    }

    fn from_maps(
        sockets: SockMap<MapData>,
        index: HashMap<MapData, u64, u32>,
        capacity: Capacity,
    ) -> Self {
        Self {
            capacity,
            sockets,
            index,
            slots: vec![None; capacity.get() as usize],
        }
    }

    pub(crate) fn sockets(&self) -> &SockMap<MapData> {
        &self.sockets
    }

    /// Place `socket` at `index`, replacing any previous occupant.
    ///
    /// A previous occupant is evicted from the table but not closed. Its
    /// cookie is returned so the caller can account for it.
    pub fn set(&mut self, index: SlotIndex, socket: &impl AsFd) -> Result<Option<SocketCookie>> {
        self.capacity.check(index)?;
        let fd = socket.as_fd();
        let cookie = validate_stream_socket(fd)?;

        if let Some(other) = self.slot_of_cookie(cookie)
            && other != index
        {
            return Err(SockmapError::InvalidDescriptor {
                reason: format!("socket {cookie} is already registered at slot {other}"),
                source: None,
            });
        }

        // Index entry first, so the verdict program never sees a socket it
        // cannot resolve.
        self.index
            .insert(cookie.get(), index.get(), 0)
            .map_err(|e| {
                SockmapError::from_map_update(format!("{SOCK_INDEX}[{cookie}] = {index}"), e)
            })?;

        if let Err(e) = self.sockets.set(index.get(), &fd, 0) {
            // Re-registering the current occupant must keep its entry.
            if self.slots[index.get() as usize] != Some(cookie)
                && let Err(rollback) = self.remove_index_entry(cookie)
            {
                warn!(
                    index = %index,
                    cookie = %cookie,
                    error = %rollback,
                    "Rollback: failed to remove index entry"
                );
            }
            return Err(SockmapError::from_map_update(
                format!("{SOCKMAP}[{index}] = {cookie}"),
                e,
            ));
        }

        let evicted = self.slots[index.get() as usize]
            .replace(cookie)
            .filter(|previous| *previous != cookie);
        if let Some(previous) = evicted {
            self.remove_index_entry(previous)?;
        }

        debug!(index = %index, cookie = %cookie, "Slot set");
        Ok(evicted)
    }

    /// Remove whatever occupies `index`. Clearing an empty slot is a no-op.
    pub fn clear(&mut self, index: SlotIndex) -> Result<()> {
        self.capacity.check(index)?;

        let Some(cookie) = self.slots[index.get() as usize] else {
            return Ok(());
        };

        // The kernel drops closed sockets from the sockmap on its own and
        // then rejects the delete of the emptied slot with EINVAL.
        match self.sockets.clear_index(&index.get()) {
            Ok(()) => {}
            Err(e) if is_not_found(&e) || os_error(&e) == Some(libc::EINVAL) => {}
            Err(e) => {
                return Err(SockmapError::from_map_update(
                    format!("clear {SOCKMAP}[{index}]"),
                    e,
                ));
            }
        }
        self.slots[index.get() as usize] = None;
        self.remove_index_entry(cookie)?;

        debug!(index = %index, cookie = %cookie, "Slot cleared");
        Ok(())
    }

    /// Cookie of the socket occupying `index`.
    pub fn occupant(&self, index: SlotIndex) -> Result<Option<SocketCookie>> {
        self.capacity.check(index)?;
        Ok(self.slots[index.get() as usize])
    }

    /// Slot the kernel program resolves for `cookie`, read from `SOCK_INDEX`.
    pub fn index_of(&self, cookie: SocketCookie) -> Result<Option<SlotIndex>> {
        match self.index.get(&cookie.get(), 0) {
            Ok(index) => Ok(Some(SlotIndex::new(index))),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(SockmapError::ResourceExhausted {
                context: format!("lookup {SOCK_INDEX}[{cookie}]"),
                source: Some(e),
            }),
        }
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Release the kernel maps. The redirect program must be detached first.
    pub fn destroy(self) {
        let occupied = self.occupied();
        drop(self.sockets);
        drop(self.index);
        info!(occupied, "Descriptor table destroyed");
    }

    fn slot_of_cookie(&self, cookie: SocketCookie) -> Option<SlotIndex> {
        self.slots
            .iter()
            .position(|slot| *slot == Some(cookie))
            .map(|i| SlotIndex::new(i as u32))
    }

    fn remove_index_entry(&mut self, cookie: SocketCookie) -> Result<()> {
        match self.index.remove(&cookie.get()) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SockmapError::from_map_update(
                format!("remove {SOCK_INDEX}[{cookie}]"),
                e,
            )),
        }
    }
}

fn is_not_found(err: &MapError) -> bool {
    matches!(err, MapError::KeyNotFound) || os_error(err) == Some(libc::ENOENT)
}
