//! Listening socket and backend connect initiation.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Backlog for the listening socket. A relay serves a handful of clients,
/// not a high fan-out workload.
pub const DEFAULT_BACKLOG: i32 = 2;

/// The process's single listening socket.
///
/// When a backend address is configured, every accepted client is paired
/// with a fresh outbound connection to it.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    backend: Option<SocketAddr>,
}

impl Listener {
    /// Bind a non-blocking listener with `SO_REUSEADDR` set.
    pub fn bind(addr: SocketAddr, backlog: i32, backend: Option<SocketAddr>) -> io::Result<Self> {
        let socket = create_listener(addr, backlog)?;
        let socket = TcpListener::from_std(socket);
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            backend,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_mut(&mut self) -> &mut TcpListener {
        &mut self.socket
    }

    /// Accept one pending client. The returned stream is non-blocking.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.socket.accept()
    }

    /// Start a non-blocking connect to the backend, if one is configured.
    ///
    /// Completion (or refusal) is reported later through ordinary
    /// writable/error readiness on the returned stream.
    pub fn connect_backend(&self) -> Option<io::Result<TcpStream>> {
        self.backend.map(TcpStream::connect)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.socket.take_error()
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
