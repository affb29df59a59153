//! Redirect table manager: the single owner of the redirect program and the
//! descriptor table for this process.
//!
//! Lifecycle is `Ready -> Closed`. Construction either completes all of
//! load, create and attach, or rolls back whatever succeeded and returns the
//! error. `close` tears down in reverse order: detach, unload, destroy.
//!
//! The manager never closes the sockets registered with it. Callers must
//! unregister a slot before (or immediately when) closing its socket.

use crate::config::ManagerConfig;
use crate::descriptor::{SocketCookie, validate_stream_socket};
use crate::error::{Result, SockmapError};
use crate::index::{Capacity, SlotIndex};
use crate::program::RedirectProgram;
use crate::table::DescriptorTable;
use std::os::fd::AsFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

struct Resources {
    program: RedirectProgram,
    table: DescriptorTable,
}

enum Lifecycle {
    Ready(Resources),
    Closed,
}

/// Owns the kernel redirect program and descriptor table.
///
/// Share it between connection tasks as `Arc<RedirectTableManager>`; all
/// operations take `&self`.
pub struct RedirectTableManager {
    capacity: Capacity,
    state: Mutex<Lifecycle>,
}

impl RedirectTableManager {
    /// Load the redirect program, create the table and attach the program.
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let capacity = Capacity::new(config.capacity)?;

        let mut program = RedirectProgram::load(&config.program_path, capacity)?;

        let table = match DescriptorTable::create(program.object_mut(), capacity) {
            Ok(table) => table,
            Err(e) => {
                error!(error = %e, "Failed to create descriptor table, rolling back");
                if let Err(unload_err) = program.unload() {
                    warn!(error = %unload_err, "Rollback: failed to unload program");
                }
                return Err(e);
            }
        };

        if let Err(e) = program.attach(&table) {
            error!(error = %e, "Failed to attach redirect program, rolling back");
            if let Err(unload_err) = program.unload() {
                warn!(error = %unload_err, "Rollback: failed to unload program");
            }
            table.destroy();
            return Err(e);
        }

        info!(capacity = %capacity, pairs = capacity.pairs(), "Redirect table manager ready");

        Ok(Self {
            capacity,
            state: Mutex::new(Lifecycle::Ready(Resources { program, table })),
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), Lifecycle::Closed)
    }

    /// Place `socket` at `index`.
    ///
    /// Once both slots of a pair are occupied, data received on either socket
    /// is sent out of the other one and never reaches the owner's reader.
    /// A previous occupant of `index` is evicted but stays open; closing it
    /// remains the caller's job.
    pub fn register(&self, socket: &impl AsFd, index: SlotIndex) -> Result<()> {
        let mut state = self.lock();
        let resources = ready(&mut state)?;

        if let Some(evicted) = resources.table.set(index, socket)? {
            warn!(
                index = %index,
                evicted = %evicted,
                "Slot overwritten, previous socket evicted but not closed"
            );
        }
        debug!(index = %index, peer = %index.peer(), "Socket registered");
        Ok(())
    }

    /// Clear the slot at `index`. Clearing an empty slot succeeds.
    pub fn unregister(&self, index: SlotIndex) -> Result<()> {
        let mut state = self.lock();
        let resources = ready(&mut state)?;

        resources.table.clear(index)?;
        debug!(index = %index, "Socket unregistered");
        Ok(())
    }

    /// Cookie of the socket registered at `index`.
    pub fn occupant(&self, index: SlotIndex) -> Result<Option<SocketCookie>> {
        let mut state = self.lock();
        ready(&mut state)?.table.occupant(index)
    }

    /// Slot the kernel resolves for `socket`, if it is registered.
    pub fn index_of(&self, socket: &impl AsFd) -> Result<Option<SlotIndex>> {
        let mut state = self.lock();
        let resources = ready(&mut state)?;
        let cookie = validate_stream_socket(socket.as_fd())?;
        resources.table.index_of(cookie)
    }

    /// Detach and unload the program, then destroy the table.
    ///
    /// Registered sockets are left open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, Lifecycle::Closed) {
            Lifecycle::Ready(resources) => {
                teardown(resources)?;
                info!("Redirect table manager closed");
                Ok(())
            }
            Lifecycle::Closed => Err(SockmapError::AlreadyClosed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RedirectTableManager {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Ready(resources) = std::mem::replace(state, Lifecycle::Closed) {
            warn!("Redirect table manager dropped without close, tearing down");
            if let Err(e) = teardown(resources) {
                error!(error = %e, "Teardown on drop failed");
            }
        }
    }
}

fn ready(state: &mut Lifecycle) -> Result<&mut Resources> {
    match state {
        Lifecycle::Ready(resources) => Ok(resources),
        Lifecycle::Closed => Err(SockmapError::InvalidState),
    }
}

/// Detach before unload, unload before destroying the table, so the kernel
/// never holds a program reference to a released table.
fn teardown(resources: Resources) -> Result<()> {
    let Resources { mut program, table } = resources;
    program.detach();
    let unloaded = program.unload();
    table.destroy();
    unloaded
}
