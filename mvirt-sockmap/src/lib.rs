//! mvirt-sockmap: kernel-assisted TCP socket splicing.
//!
//! Two TCP connections registered at paired slots of a sockmap are spliced
//! together: data received on either socket is sent out of the other by an
//! `sk_skb` verdict program, without a copy through userspace.
//!
//! # Architecture
//!
//! ```text
//! client A --> socket @ slot 2k   --+
//!                                   +--> sk_skb verdict (Kernel)
//! client B --> socket @ slot 2k+1 --+        |
//!                                            +--> bpf_sk_redirect_map(peer slot)
//!                                            +--> SK_PASS to own reader (peer empty)
//! ```
//!
//! [`RedirectTableManager`] owns the redirect program and the descriptor
//! table. [`Binder`] is the thin TCP glue around it.

pub mod allocator;
pub mod binder;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod index;
pub mod manager;
pub mod program;
pub mod table;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use allocator::PairAllocator;
pub use binder::{Binder, bind_listener};
pub use config::{BinderConfig, ManagerConfig};
pub use descriptor::{SocketCookie, SocketHandle};
pub use error::{Result, SockmapError};
pub use index::{Capacity, SlotIndex};
pub use manager::RedirectTableManager;
