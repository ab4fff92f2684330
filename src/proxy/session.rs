//! A spliced client/backend connection pair.
//!
//! # Data Flow
//! ```text
//! client socket → ring A → backend socket      (client.in  == backend.out)
//! backend socket → ring B → client socket      (backend.in == client.out)
//! ```
//!
//! EOF on one side is forwarded as a write shutdown to the other side once
//! the bytes already buffered for it are flushed. The session closes when
//! both directions are finished, on any socket error, or on idle timeout.

use std::cell::Cell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tokio::sync::Notify;

use crate::net::{Connection, ConnectionHandler};

/// Snapshot of a running session, safe to hand to other threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub client: SocketAddr,
    pub backend: SocketAddr,
    pub event_loop: String,
    pub started_at: Instant,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({} -> {} on {})", self.client, self.backend, self.event_loop)
    }
}

pub struct Session {
    active: Rc<Connection>,
    passive: Rc<Connection>,
    closed: Cell<bool>,
    done: Notify,
}

impl Session {
    /// `active` is the client side, `passive` the backend side.
    pub fn new(active: Rc<Connection>, passive: Rc<Connection>) -> Rc<Self> {
        Rc::new(Self {
            active,
            passive,
            closed: Cell::new(false),
            done: Notify::new(),
        })
    }

    /// Drive both connections on the current loop.
    pub fn start(self: &Rc<Self>) {
        let handler: Rc<dyn ConnectionHandler> = Rc::new(SessionHandler {
            session: Rc::downgrade(self),
        });
        self.active.start(handler.clone());
        self.passive.start(handler);
    }

    pub fn active(&self) -> &Rc<Connection> {
        &self.active
    }

    pub fn passive(&self) -> &Rc<Connection> {
        &self.passive
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Close both connections. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.active.close();
        self.passive.close();
        self.done.notify_one();
        tracing::trace!(client = %self.active.remote(), backend = %self.passive.remote(), "Session closed");
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        if self.closed.get() {
            return;
        }
        self.done.notified().await;
    }

    fn other(&self, conn: &Rc<Connection>) -> &Rc<Connection> {
        if Rc::ptr_eq(conn, &self.active) {
            &self.passive
        } else {
            &self.active
        }
    }

    /// Both peers sent EOF and everything they sent has been delivered.
    fn finished(&self) -> bool {
        self.active.is_remote_closed()
            && self.passive.is_remote_closed()
            && self.active.out_buffer().used() == 0
            && self.passive.out_buffer().used() == 0
    }
}

struct SessionHandler {
    session: Weak<Session>,
}

impl ConnectionHandler for SessionHandler {
    fn remote_closed(&self, conn: &Rc<Connection>) {
        let Some(session) = self.session.upgrade() else {
            conn.close();
            return;
        };
        let other = session.other(conn);
        // bytes still buffered for the other side are flushed first, see drained()
        if conn.in_buffer().used() == 0 {
            other.close_write();
        }
        if session.finished() {
            session.close();
        }
    }

    fn drained(&self, conn: &Rc<Connection>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.other(conn).is_remote_closed() {
            conn.close_write();
        }
        if session.finished() {
            session.close();
        }
    }

    fn exception(&self, conn: &Rc<Connection>, err: std::io::Error) {
        tracing::debug!(connection = %conn, error = %err, "Session connection failed");
        match self.session.upgrade() {
            Some(session) => session.close(),
            None => conn.close(),
        }
    }

    fn timeout(&self, conn: &Rc<Connection>) {
        tracing::debug!(connection = %conn, "Session idle timeout");
        match self.session.upgrade() {
            Some(session) => session.close(),
            None => conn.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::RingBuffer;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::LocalSet;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    /// Returns the session plus the far ends: (client peer, backend peer).
    async fn spliced(size: usize) -> (Rc<Session>, TcpStream, TcpStream) {
        let (client_peer, client_side) = socket_pair().await;
        let (backend_side, backend_peer) = socket_pair().await;
        let a = Rc::new(RingBuffer::with_capacity(size));
        let b = Rc::new(RingBuffer::with_capacity(size));
        let timeout = Duration::from_secs(30);
        let client_remote = client_side.peer_addr().unwrap();
        let backend_remote = backend_side.peer_addr().unwrap();
        let active = Connection::new(client_side, client_remote, a.clone(), b.clone(), timeout);
        let passive = Connection::new(backend_side, backend_remote, b, a, timeout);
        let session = Session::new(active, passive);
        session.start();
        (session, client_peer, backend_peer)
    }

    #[tokio::test]
    async fn splices_both_directions() {
        LocalSet::new()
            .run_until(async {
                let (session, mut client, mut backend) = spliced(8).await;

                let payload: Vec<u8> = (0..200u8).collect();
                client.write_all(&payload).await.unwrap();
                let mut got = vec![0u8; payload.len()];
                backend.read_exact(&mut got).await.unwrap();
                assert_eq!(got, payload);

                backend.write_all(b"pong").await.unwrap();
                let mut pong = [0u8; 4];
                client.read_exact(&mut pong).await.unwrap();
                assert_eq!(&pong, b"pong");

                session.close();
                assert!(session.active().is_closed());
                assert!(session.passive().is_closed());
            })
            .await;
    }

    #[tokio::test]
    async fn half_close_is_forwarded_then_session_finishes() {
        LocalSet::new()
            .run_until(async {
                let (session, mut client, mut backend) = spliced(64).await;

                client.write_all(b"request").await.unwrap();
                client.shutdown().await.unwrap();

                let mut req = Vec::new();
                backend.read_to_end(&mut req).await.unwrap();
                assert_eq!(req, b"request");

                backend.write_all(b"response").await.unwrap();
                backend.shutdown().await.unwrap();

                let mut resp = Vec::new();
                client.read_to_end(&mut resp).await.unwrap();
                assert_eq!(resp, b"response");

                tokio::time::timeout(Duration::from_secs(2), session.closed())
                    .await
                    .unwrap();
                assert!(session.is_closed());
            })
            .await;
    }

    #[tokio::test]
    async fn backend_reset_closes_client() {
        LocalSet::new()
            .run_until(async {
                let (session, mut client, backend) = spliced(64).await;
                drop(backend);

                // EOF from the backend is forwarded; the client then closes too
                let mut buf = [0u8; 8];
                let n = client.read(&mut buf).await.unwrap();
                assert_eq!(n, 0);
                drop(client);

                tokio::time::timeout(Duration::from_secs(2), session.closed())
                    .await
                    .unwrap();
            })
            .await;
    }
}
