//! Per-proxy settings and injected collaborators.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::load_balancer::Connector;

/// Addresses of an accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// Chooses the backend for a client; `None` rejects the client.
/// Runs on the accepting loop.
pub type ConnectorGen = Arc<dyn Fn(&ClientInfo) -> Option<Connector> + Send + Sync>;

/// Supplies the loop a session runs on; `None` rejects the client.
pub type LoopProvider = Arc<dyn Fn() -> Option<EventLoop> + Send + Sync>;

/// Settings of one [`Proxy`](crate::proxy::Proxy). Sizes and timeout may be
/// changed while running and apply to the next accepted connection.
pub struct ProxyNetConfig {
    accept_loop: EventLoop,
    connector_gen: ConnectorGen,
    loop_provider: LoopProvider,
    timeout_ms: AtomicU64,
    connect_timeout_ms: AtomicU64,
    in_buffer_size: AtomicUsize,
    out_buffer_size: AtomicUsize,
}

impl ProxyNetConfig {
    pub fn new(accept_loop: EventLoop, connector_gen: ConnectorGen, loop_provider: LoopProvider) -> Self {
        Self {
            accept_loop,
            connector_gen,
            loop_provider,
            timeout_ms: AtomicU64::new(15 * 60 * 1000),
            connect_timeout_ms: AtomicU64::new(3000),
            in_buffer_size: AtomicUsize::new(16 * 1024),
            out_buffer_size: AtomicUsize::new(16 * 1024),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        self.set_connect_timeout(timeout);
        self
    }

    pub fn with_buffer_sizes(self, in_size: usize, out_size: usize) -> Self {
        self.set_in_buffer_size(in_size);
        self.set_out_buffer_size(out_size);
        self
    }

    pub fn accept_loop(&self) -> &EventLoop {
        &self.accept_loop
    }

    pub fn connector_gen(&self) -> &ConnectorGen {
        &self.connector_gen
    }

    pub fn loop_provider(&self) -> &LoopProvider {
        &self.loop_provider
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Bound on establishing the backend connection, separate from the idle timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn in_buffer_size(&self) -> usize {
        self.in_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_in_buffer_size(&self, size: usize) {
        self.in_buffer_size.store(size, Ordering::Relaxed);
    }

    pub fn out_buffer_size(&self) -> usize {
        self.out_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_out_buffer_size(&self, size: usize) {
        self.out_buffer_size.store(size, Ordering::Relaxed);
    }
}

impl fmt::Debug for ProxyNetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyNetConfig")
            .field("accept_loop", &self.accept_loop.alias())
            .field("timeout", &self.timeout())
            .field("connect_timeout", &self.connect_timeout())
            .field("in_buffer_size", &self.in_buffer_size())
            .field("out_buffer_size", &self.out_buffer_size())
            .finish()
    }
}
