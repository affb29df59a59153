//! Test utilities for mvirt-sockmap integration tests.
//!
//! Provides connected loopback TCP pairs and the location of the compiled
//! redirect program. Tests using the manager need root (or CAP_BPF +
//! CAP_NET_ADMIN) and the program built from mvirt-sockmap-programs.

use crate::config::ManagerConfig;
use crate::program::DEFAULT_PROGRAM_PATH;
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the redirect program path
pub const PROGRAM_ENV: &str = "MVIRT_SOCKMAP_PROGRAM";

/// Default timeout for socket reads in tests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout used when asserting that nothing arrives
pub const QUIET_TIMEOUT: Duration = Duration::from_millis(200);

/// Path of the compiled redirect program.
pub fn program_path() -> PathBuf {
    std::env::var_os(PROGRAM_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM_PATH))
}

/// Manager configuration for tests.
pub fn test_manager_config(capacity: u32) -> ManagerConfig {
    ManagerConfig::new(program_path(), capacity)
}

/// An established loopback connection.
///
/// `server` is the accepted side, the one registered in the table. `client`
/// is the remote peer writing into it and reading what the table sends out.
pub struct TcpPair {
    pub client: TcpStream,
    pub server: TcpStream,
}

impl TcpPair {
    pub fn connect() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (server, _) = listener.accept()?;
        client.set_nodelay(true)?;
        server.set_nodelay(true)?;
        Ok(Self { client, server })
    }
}

/// Read exactly `len` bytes, failing after `timeout`.
pub fn read_exact_timeout(stream: &mut TcpStream, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// True if no data arrives on `stream` within `timeout`.
pub fn is_quiet(stream: &mut TcpStream, timeout: Duration) -> io::Result<bool> {
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tcp_pair_is_connected() {
        let mut pair = TcpPair::connect().unwrap();
        pair.client.write_all(b"ping").unwrap();
        let data = read_exact_timeout(&mut pair.server, 4, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(data, b"ping");
    }

    #[test]
    fn test_is_quiet_without_data() {
        let mut pair = TcpPair::connect().unwrap();
        assert!(is_quiet(&mut pair.server, QUIET_TIMEOUT).unwrap());
    }
}
