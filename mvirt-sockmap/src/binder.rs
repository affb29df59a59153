//! Connection binder: accepts TCP connections and splices them into pairs.
//!
//! Each accepted connection gets a slot from the [`PairAllocator`], and a
//! duplicate of its descriptor is registered at that slot. The original
//! stream stays with a per-connection task that reads until the client goes
//! away. Once spliced, the reader sees no data, only EOF or an error.

use crate::allocator::PairAllocator;
use crate::config::BinderConfig;
use crate::descriptor::SocketHandle;
use crate::error::SockmapError;
use crate::index::SlotIndex;
use crate::manager::RedirectTableManager;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Create the listening socket.
pub fn bind_listener(config: &BinderConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(config.listen),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&config.listen.into())?;
    socket.listen(config.backlog)?;
    TcpListener::from_std(socket.into())
}

/// Accept loop feeding connections into the redirect table.
pub struct Binder {
    manager: Arc<RedirectTableManager>,
    allocator: Arc<PairAllocator>,
}

impl Binder {
    pub fn new(manager: Arc<RedirectTableManager>) -> Self {
        let allocator = Arc::new(PairAllocator::new(manager.capacity()));
        Self { manager, allocator }
    }

    pub fn allocator(&self) -> &Arc<PairAllocator> {
        &self.allocator
    }

    /// Accept connections until `shutdown` completes.
    pub async fn run(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Listening");
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = self.accept_connection(stream, peer);
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    /// Register one accepted connection and spawn its close watcher.
    ///
    /// On failure only this connection is closed.
    pub fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) -> Option<JoinHandle<()>> {
        let Some(index) = self.allocator.acquire() else {
            warn!(peer = %peer, "Redirect table full, closing connection");
            return None;
        };

        let handle = match SocketHandle::duplicate(&stream) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to duplicate socket, closing connection");
                self.allocator.release(index);
                return None;
            }
        };

        if let Err(e) = self.manager.register(&handle, index) {
            warn!(peer = %peer, index = %index, error = %e, "Failed to register socket, closing connection");
            self.allocator.release(index);
            return None;
        }

        info!(peer = %peer, index = %index, peer_index = %index.peer(), "Accepted connection");

        let connection = Connection {
            stream,
            handle,
            index,
            peer,
        };
        let manager = Arc::clone(&self.manager);
        let allocator = Arc::clone(&self.allocator);
        Some(tokio::spawn(async move {
            let mut connection = connection;
            connection.wait_for_close().await;
            connection.close(&manager, &allocator);
        }))
    }
}

/// A spliced connection: the original stream and the duplicate in the table.
struct Connection {
    stream: TcpStream,
    handle: SocketHandle,
    index: SlotIndex,
    peer: SocketAddr,
}

impl Connection {
    async fn wait_for_close(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            // Only the unspliced side of a half pair ever sees data here.
            match self.stream.read(&mut buf).await {
                Ok(0) => {
                    debug!(peer = %self.peer, "Connection closed by client");
                    return;
                }
                Ok(n) => debug!(peer = %self.peer, bytes = n, "Read on unspliced connection"),
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Read error");
                    return;
                }
            }
        }
    }

    /// Unregister first, then close the duplicate and the stream.
    fn close(self, manager: &RedirectTableManager, allocator: &PairAllocator) {
        match manager.unregister(self.index) {
            Ok(()) => {}
            Err(SockmapError::InvalidState) => {
                debug!(index = %self.index, "Manager already closed, nothing to unregister")
            }
            Err(e) => warn!(index = %self.index, error = %e, "Failed to unregister socket"),
        }
        allocator.release(self.index);

        info!(peer = %self.peer, index = %self.index, "Closing connection");
        drop(self.handle);
        drop(self.stream);
    }
}
