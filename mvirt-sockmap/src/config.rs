//! Daemon and manager configuration.

use crate::program::DEFAULT_PROGRAM_PATH;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default listen address of the splicing daemon.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:12345";

/// Default number of table slots (one pair).
pub const DEFAULT_CAPACITY: u32 = 2;

/// Redirect table manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path of the compiled redirect object
    pub program_path: PathBuf,
    /// Number of table slots, even and at least 2
    pub capacity: u32,
}

impl ManagerConfig {
    pub fn new(program_path: impl Into<PathBuf>, capacity: u32) -> Self {
        Self {
            program_path: program_path.into(),
            capacity,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM_PATH, DEFAULT_CAPACITY)
    }
}

/// Connection binder configuration.
#[derive(Debug, Clone)]
pub struct BinderConfig {
    pub listen: SocketAddr,
    /// Listen backlog
    pub backlog: i32,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 12345).into(),
            backlog: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let manager = ManagerConfig::default();
        assert_eq!(manager.capacity, DEFAULT_CAPACITY);
        assert_eq!(manager.program_path, PathBuf::from(DEFAULT_PROGRAM_PATH));

        let binder = BinderConfig::default();
        assert_eq!(binder.listen, DEFAULT_LISTEN.parse().unwrap());
    }
}
