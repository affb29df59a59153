//! Error taxonomy shared by the table, the program loader and the manager.

use aya::maps::MapError;
use aya::programs::ProgramError;
use std::io;
use thiserror::Error;

/// Redirect program loading errors. Always fatal for the process.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to open BPF object {path}: {source}")]
    Object {
        path: String,
        #[source]
        source: aya::BpfError,
    },

    #[error("Program not found: {0}")]
    ProgramNotFound(&'static str),

    #[error("Program {name} rejected by the kernel: {source}")]
    Program {
        name: &'static str,
        #[source]
        source: ProgramError,
    },
}

/// Redirect program attach errors.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Redirect program is already attached")]
    AlreadyAttached,

    #[error("Redirect program is not loaded")]
    NotLoaded,

    #[error("Failed to access sockmap: {0}")]
    Map(#[source] MapError),

    #[error("Failed to duplicate sockmap fd: {0}")]
    MapFd(#[source] io::Error),

    #[error("Failed to attach {name}: {source}")]
    Program {
        name: &'static str,
        #[source]
        source: ProgramError,
    },
}

/// Redirect table errors.
#[derive(Debug, Error)]
pub enum SockmapError {
    #[error("Failed to load redirect program: {0}")]
    Load(#[from] LoadError),

    #[error("Failed to attach redirect program: {0}")]
    Attach(#[from] AttachError),

    #[error("Kernel resources exhausted: {context}")]
    ResourceExhausted {
        context: String,
        #[source]
        source: Option<MapError>,
    },

    #[error("Slot index {index} out of range (capacity {capacity})")]
    InvalidIndex { index: u32, capacity: u32 },

    #[error("Invalid socket descriptor: {reason}")]
    InvalidDescriptor {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Invalid table capacity {0}: must be even and at least 2")]
    InvalidCapacity(u32),

    #[error("Redirect table manager is closed")]
    InvalidState,

    #[error("Redirect table manager is already closed")]
    AlreadyClosed,
}

pub type Result<T> = std::result::Result<T, SockmapError>;

impl SockmapError {
    pub(crate) fn exhausted(context: impl Into<String>) -> Self {
        SockmapError::ResourceExhausted {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn invalid_descriptor(reason: impl Into<String>, source: io::Error) -> Self {
        SockmapError::InvalidDescriptor {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Classify a failed sockmap update by the errno the kernel returned.
    ///
    /// Errors that describe the socket itself (not a TCP socket, not
    /// established, already closed) are the caller's fault; everything else
    /// is a kernel resource limit.
    pub(crate) fn from_map_update(context: impl Into<String>, err: MapError) -> Self {
        let context = context.into();
        match os_error(&err) {
            Some(errno) if is_descriptor_errno(errno) => SockmapError::InvalidDescriptor {
                source: Some(io::Error::from_raw_os_error(errno)),
                reason: context,
            },
            _ => SockmapError::ResourceExhausted {
                context,
                source: Some(err),
            },
        }
    }
}

fn is_descriptor_errno(errno: i32) -> bool {
    matches!(
        errno,
        libc::EOPNOTSUPP | libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EISCONN
    )
}

/// First OS error code found in an error's source chain.
pub(crate) fn os_error(err: &(dyn std::error::Error + 'static)) -> Option<i32> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return io.raw_os_error();
        }
        current = e.source();
    }
    None
}
