// ABOUTME: Shared listening socket: reserved by the primary, bound by every worker
//
// The primary resolves the address once (port 0 becomes a concrete port) and
// exports it through LISTEN_ENV; each worker then binds its own socket to the
// same address with SO_REUSEPORT so the kernel spreads connections.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};
use tracing::debug;

/// Environment variable carrying the shared address to workers.
pub const LISTEN_ENV: &str = "PREFORK_LISTEN_ADDR";

const BACKLOG: u32 = 1024;

fn socket_for(address: SocketAddr, reuse_port: bool) -> io::Result<TcpSocket> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    if reuse_port {
        socket.set_reuseport(true)?;
    }
    Ok(socket)
}

/// Bound but never listening socket held by the primary.
///
/// It pins the port for the lifetime of the cluster without receiving any
/// connections itself.
#[derive(Debug)]
pub struct SharedAddress {
    socket: TcpSocket,
    address: SocketAddr,
    reuse_port: bool,
}

impl SharedAddress {
    /// Reserve `address`. Must be called within a tokio runtime.
    pub fn reserve(address: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        let socket = socket_for(address, reuse_port)?;
        socket.bind(address)?;
        let address = socket.local_addr()?;
        debug!(address = %address, reuse_port = reuse_port, "Reserved shared address");
        Ok(Self {
            socket,
            address,
            reuse_port,
        })
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub const fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    /// Make the address visible to workers started from now on.
    pub fn export(&self) {
        std::env::set_var(LISTEN_ENV, self.address.to_string());
    }

    #[must_use]
    pub const fn socket(&self) -> &TcpSocket {
        &self.socket
    }
}

/// Address exported by the primary, if any.
#[must_use]
pub fn shared_address() -> Option<SocketAddr> {
    std::env::var(LISTEN_ENV).ok()?.parse().ok()
}

/// Bind a listener on `address`, sharing the port when `reuse_port` is set.
pub fn bind(address: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = socket_for(address, reuse_port)?;
    socket.bind(address)?;
    socket.listen(BACKLOG)
}
