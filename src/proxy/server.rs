//! Accept loop and session bookkeeping for one listening socket.
//!
//! # Responsibilities
//! - Accept on the acceptor loop the socket was handed to
//! - Ask the connector generator for a backend, then the loop provider for a worker
//! - Connect to the backend on the worker loop and splice the pair
//! - Track live sessions for counting and snapshots
//! - Stop on request or when the acceptor loop closes

use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::LbError;
use crate::event_loop::{EventLoop, EventLoopAttach};
use crate::load_balancer::Connector;
use crate::net::{BindServer, Connection, RingBuffer};
use crate::observability::metrics;
use crate::proxy::config::{ClientInfo, ProxyNetConfig};
use crate::proxy::session::{Session, SessionInfo};

/// Told when a proxy stops, so its owner can drop it.
pub trait ProxyEventHandler: Send + Sync {
    fn server_removed(&self, proxy: &Proxy);
}

/// Forwarding engine for one listening socket on one acceptor loop.
pub struct Proxy {
    id: String,
    local_addr: SocketAddr,
    config: ProxyNetConfig,
    handler: Arc<dyn ProxyEventHandler>,
    sessions: DashMap<u64, SessionInfo>,
    next_session: AtomicU64,
    stop: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Proxy {
    pub fn new(local_addr: SocketAddr, config: ProxyNetConfig, handler: Arc<dyn ProxyEventHandler>) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            id: format!("Proxy({}@{})", local_addr, config.accept_loop().alias()),
            local_addr,
            config,
            handler,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            stop,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ProxyNetConfig {
        &self.config
    }

    pub fn accept_loop(&self) -> &EventLoop {
        self.config.accept_loop()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Start accepting on `server` from the acceptor loop.
    pub fn handle(self: &Arc<Self>, server: BindServer) -> Result<(), LbError> {
        let accept_loop = self.config.accept_loop().clone();
        accept_loop.attach_resource(self.clone())?;

        let proxy = self.clone();
        let stop = self.stop.subscribe();
        if let Err(e) = accept_loop.run_on_loop(move || {
            tokio::task::spawn_local(proxy.accept(server, stop));
        }) {
            let _ = accept_loop.detach_resource(&self.id);
            return Err(e);
        }
        tracing::info!(proxy = %self.id, "Proxy accepting");
        Ok(())
    }

    async fn accept(self: Arc<Self>, server: BindServer, mut stop: watch::Receiver<bool>) {
        let listener = match server.into_listener() {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(proxy = %self.id, error = %e, "Failed to register listener");
                self.stop();
                return;
            }
        };

        while !*stop.borrow() {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.on_accept(stream, remote),
                    Err(e) => tracing::warn!(proxy = %self.id, error = %e, "Accept failed"),
                },
            }
        }
        tracing::debug!(proxy = %self.id, "Accept loop exited");
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let info = ClientInfo {
            remote,
            local: stream.local_addr().unwrap_or(self.local_addr),
        };

        let Some(connector) = (self.config.connector_gen())(&info) else {
            tracing::debug!(proxy = %self.id, client = %remote, "No backend for client, closing");
            return;
        };
        let Some(worker) = (self.config.loop_provider())() else {
            tracing::debug!(proxy = %self.id, client = %remote, "No worker loop for client, closing");
            metrics::record_rejected("no_worker");
            return;
        };

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(proxy = %self.id, client = %remote, error = %e, "Failed to detach client socket");
                return;
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let proxy = self.clone();
        let stop = self.stop.subscribe();
        let worker_alias = worker.alias().to_string();
        if let Err(e) = worker.run_on_loop(move || {
            tokio::task::spawn_local(proxy.run_session(id, worker_alias, stream, info, connector, stop));
        }) {
            tracing::warn!(proxy = %self.id, client = %remote, error = %e, "Worker loop unavailable, closing client");
        }
    }

    async fn run_session(
        self: Arc<Self>,
        id: u64,
        worker: String,
        stream: std::net::TcpStream,
        client: ClientInfo,
        connector: Connector,
        mut stop: watch::Receiver<bool>,
    ) {
        if *stop.borrow() {
            return;
        }
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(proxy = %self.id, client = %client.remote, error = %e, "Failed to register client socket");
                return;
            }
        };

        let timeout = self.config.timeout();
        let client_in = Rc::new(RingBuffer::with_capacity(self.config.in_buffer_size()));
        let client_out = Rc::new(RingBuffer::with_capacity(self.config.out_buffer_size()));
        let active = Connection::new(stream, client.remote, client_in.clone(), client_out.clone(), timeout);

        let backend_addr = connector.remote();
        let connect = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(backend_addr));
        let backend = tokio::select! {
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(proxy = %self.id, backend = %backend_addr, error = %e, "Backend connect failed, closing client");
                    metrics::record_rejected("connect_failed");
                    active.close();
                    return;
                }
                Err(_) => {
                    tracing::debug!(proxy = %self.id, backend = %backend_addr, "Backend connect timed out, closing client");
                    metrics::record_rejected("connect_failed");
                    active.close();
                    return;
                }
            },
            _ = stop.changed() => {
                active.close();
                return;
            }
        };

        let passive = Connection::new(backend, backend_addr, client_out, client_in, timeout);
        connector.connected(&passive);

        let session = Session::new(active, passive);
        // also dropped with this task when the worker loop closes under it
        let _entry = SessionEntry::register(
            &self.sessions,
            SessionInfo {
                id,
                client: client.remote,
                backend: backend_addr,
                event_loop: worker,
                started_at: Instant::now(),
            },
        );
        tracing::debug!(proxy = %self.id, client = %client.remote, backend = %backend_addr, "Session established");

        session.start();
        tokio::select! {
            _ = session.closed() => {}
            _ = stop.changed() => session.close(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn copy_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Stop accepting, close every session and tell the owner. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop.send(true);
        let _ = self.config.accept_loop().detach_resource(&self.id);
        tracing::info!(proxy = %self.id, sessions = self.session_count(), "Proxy stopped");
        self.handler.server_removed(self);
    }
}

/// Keeps a session listed while it is alive.
struct SessionEntry<'a> {
    sessions: &'a DashMap<u64, SessionInfo>,
    id: u64,
}

impl<'a> SessionEntry<'a> {
    fn register(sessions: &'a DashMap<u64, SessionInfo>, info: SessionInfo) -> Self {
        let id = info.id;
        sessions.insert(id, info);
        metrics::record_session_opened();
        Self { sessions, id }
    }
}

impl Drop for SessionEntry<'_> {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        metrics::record_session_closed();
    }
}

impl EventLoopAttach for Proxy {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn on_close(&self) {
        tracing::debug!(proxy = %self.id, "Acceptor loop closed");
        self.stop();
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("sessions", &self.session_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::backend::tests::handle;
    use crate::proxy::config::{ConnectorGen, LoopProvider};
    use socket2::{Domain, Socket, Type};
    use std::io::{ErrorKind, Read};
    use std::time::Duration;

    struct Quiet;

    impl ProxyEventHandler for Quiet {
        fn server_removed(&self, _proxy: &Proxy) {}
    }

    /// A listener whose accept queue is full, so further SYNs go unanswered.
    fn unanswered_backend() -> (Socket, Vec<std::net::TcpStream>, SocketAddr) {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&bind.into()).unwrap();
        socket.listen(0).unwrap();
        let addr = socket.local_addr().unwrap().as_socket().unwrap();
        let queued = (0..4)
            .filter_map(|_| std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(100)).ok())
            .collect();
        (socket, queued, addr)
    }

    #[test]
    fn test_backend_connect_is_bounded_by_connect_timeout() {
        let (_backend, _queued, backend_addr) = unanswered_backend();
        let accept = EventLoop::spawn("proxy-accept").unwrap();
        let worker = EventLoop::spawn("proxy-worker").unwrap();

        let connector = Connector::new(handle("slow", backend_addr.port(), 1, true));
        let connector_gen: ConnectorGen = Arc::new(move |_: &ClientInfo| Some(connector.clone()));
        let session_loop = worker.clone();
        let loop_provider: LoopProvider = Arc::new(move || Some(session_loop.clone()));
        let config = ProxyNetConfig::new(accept.clone(), connector_gen, loop_provider)
            .with_timeout(Duration::from_secs(60))
            .with_connect_timeout(Duration::from_millis(150));

        let server = BindServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let proxy = Proxy::new(server.local_addr(), config, Arc::new(Quiet));
        proxy.handle(server).unwrap();

        let started = Instant::now();
        let mut client = std::net::TcpStream::connect(proxy.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert!(
                !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "client still open after {:?}",
                started.elapsed()
            ),
        }
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(proxy.session_count(), 0);

        proxy.stop();
        accept.close();
        worker.close();
    }

    #[test]
    fn test_session_entry_removed_on_drop() {
        let sessions = DashMap::new();
        let info = SessionInfo {
            id: 9,
            client: "127.0.0.1:1000".parse().unwrap(),
            backend: "127.0.0.1:2000".parse().unwrap(),
            event_loop: "w-0".into(),
            started_at: Instant::now(),
        };
        let entry = SessionEntry::register(&sessions, info);
        assert_eq!(sessions.len(), 1);
        drop(entry);
        assert!(sessions.is_empty());
    }
}
