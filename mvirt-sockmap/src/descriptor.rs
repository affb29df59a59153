//! Socket descriptor ownership for spliced connections.
//!
//! A connection handed to the redirect table has two owned descriptors over
//! the same kernel socket: the one inside the connection object (used to
//! detect the peer closing) and a duplicate registered in the table. The
//! socket is only released once both are closed, so the connection task must
//! unregister the slot and then drop both handles.

use crate::error::{Result, SockmapError};
use nix::sys::socket::{SockType, getsockopt, sockopt};
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// Kernel-unique socket identifier (`SO_COOKIE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketCookie(u64);

impl SocketCookie {
    pub const fn new(cookie: u64) -> Self {
        Self(cookie)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Duplicate descriptor of a connected socket, owned by the redirect table
/// side of a connection.
#[derive(Debug)]
pub struct SocketHandle {
    fd: OwnedFd,
}

impl SocketHandle {
    /// Duplicate the descriptor of `socket`. The original keeps working and
    /// must be closed separately.
    pub fn duplicate(socket: &impl AsFd) -> io::Result<Self> {
        let fd = socket.as_fd().try_clone_to_owned()?;
        Ok(Self { fd })
    }

    pub fn cookie(&self) -> io::Result<SocketCookie> {
        socket_cookie(self.fd.as_fd())
    }
}

impl AsFd for SocketHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Read the socket cookie of `fd`.
pub fn socket_cookie(fd: BorrowedFd<'_>) -> io::Result<SocketCookie> {
    let mut cookie: u64 = 0;
    let mut len = mem::size_of::<u64>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(SocketCookie(cookie))
}

/// Check that `fd` is an open stream socket and return its cookie.
pub(crate) fn validate_stream_socket(fd: BorrowedFd<'_>) -> Result<SocketCookie> {
    let sock_type = getsockopt(&fd, sockopt::SockType).map_err(|errno| {
        SockmapError::invalid_descriptor(
            format!("fd {} is not an open socket", fd.as_raw_fd()),
            io::Error::from(errno),
        )
    })?;

    if sock_type != SockType::Stream {
        return Err(SockmapError::InvalidDescriptor {
            reason: format!(
                "fd {} is a {:?} socket, expected a stream socket",
                fd.as_raw_fd(),
                sock_type
            ),
            source: None,
        });
    }

    socket_cookie(fd).map_err(|e| {
        SockmapError::invalid_descriptor(
            format!("failed to read cookie of fd {}", fd.as_raw_fd()),
            e,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream, UdpSocket};

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_duplicate_shares_cookie() {
        let (client, _server) = tcp_pair();
        let handle = SocketHandle::duplicate(&client).unwrap();

        assert_ne!(handle.as_fd().as_raw_fd(), client.as_raw_fd());
        assert_eq!(
            handle.cookie().unwrap(),
            socket_cookie(client.as_fd()).unwrap()
        );
    }

    #[test]
    fn test_cookies_differ_per_socket() {
        let (client, server) = tcp_pair();
        assert_ne!(
            socket_cookie(client.as_fd()).unwrap(),
            socket_cookie(server.as_fd()).unwrap()
        );
    }

    #[test]
    fn test_dropping_duplicate_keeps_socket_open() {
        use std::io::{Read, Write};

        let (mut client, mut server) = tcp_pair();
        let handle = SocketHandle::duplicate(&server).unwrap();
        drop(handle);

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_validate_accepts_tcp_socket() {
        let (client, _server) = tcp_pair();
        let cookie = validate_stream_socket(client.as_fd()).unwrap();
        assert_eq!(cookie, socket_cookie(client.as_fd()).unwrap());
    }

    #[test]
    fn test_validate_rejects_non_socket() {
        let file = std::fs::File::open("/dev/null").unwrap();
        assert!(matches!(
            validate_stream_socket(file.as_fd()),
            Err(SockmapError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_datagram_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(matches!(
            validate_stream_socket(socket.as_fd()),
            Err(SockmapError::InvalidDescriptor { source: None, .. })
        ));
    }
}
