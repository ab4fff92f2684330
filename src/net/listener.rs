//! Listening socket setup.
//!
//! # Responsibilities
//! - Bind a non-blocking listening socket with address (and port) reuse
//! - Let several acceptor loops bind the same address, one socket each
//! - Hand the socket to a loop, which wraps it into a tokio listener
//!
//! Binding happens on the calling thread so errors surface synchronously;
//! only the registration with the reactor happens on the loop.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

const LISTEN_BACKLOG: i32 = 1024;

/// A bound, listening socket that has not yet been registered with a loop.
#[derive(Debug)]
pub struct BindServer {
    socket: std::net::TcpListener,
    local_addr: SocketAddr,
}

impl BindServer {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let socket: std::net::TcpListener = socket.into();
        let local_addr = socket.local_addr()?;
        tracing::debug!(address = %local_addr, "Listener bound");
        Ok(Self { socket, local_addr })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register with the current loop's reactor. Must run on a loop thread.
    pub fn into_listener(self) -> io::Result<TcpListener> {
        TcpListener::from_std(self.socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_accepts() {
        let server = BindServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let listener = server.into_listener().unwrap();
        let (client, accepted) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        assert!(client.is_ok());
        assert_eq!(accepted.unwrap().1, client.unwrap().local_addr().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn same_address_can_be_bound_twice() {
        let first = BindServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let second = BindServer::bind(first.local_addr()).unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
    }

    #[test]
    fn bind_error_is_reported() {
        // TEST-NET-1, never assigned to a local interface
        let result = BindServer::bind("192.0.2.1:0".parse().unwrap());
        assert!(result.is_err());
    }
}
