//! The load balancer facade.
//!
//! # Responsibilities
//! - Bind one listening socket per acceptor loop and run a Proxy on each
//! - Choose backends per client: security policy, sticky table, server group
//! - Follow acceptor group changes: new loops get a listener, closure destroys
//!
//! # State
//! ```text
//! not started ──start()──▶ started ──stop()──▶ stopped ──start()──▶ started
//!      │                      │                   │
//!      └──────────────────────┴──destroy()────────┴──▶ destroyed (terminal)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::LbError;
use crate::event_loop::wrapper::lock;
use crate::event_loop::{EventLoop, EventLoopGroup, EventLoopGroupAttach};
use crate::lb::persist::{Persist, PersistMap};
use crate::load_balancer::{Connector, ServerGroup};
use crate::net::BindServer;
use crate::observability::metrics;
use crate::proxy::{ClientInfo, ConnectorGen, LoopProvider, Proxy, ProxyEventHandler, ProxyNetConfig, SessionInfo};
use crate::security::{Protocol, SecurityPolicy};

struct LbState {
    /// `true` until start() and after stop(); loop additions are ignored meanwhile.
    stopped: bool,
    destroyed: bool,
}

/// A TCP load balancer listening on one address.
pub struct TcpLb {
    alias: String,
    acceptor_group: Arc<EventLoopGroup>,
    worker_group: Arc<EventLoopGroup>,
    bind_address: SocketAddr,
    backend: Arc<ServerGroup>,
    security: Arc<dyn SecurityPolicy>,

    timeout_ms: AtomicU64,
    in_buffer_size: AtomicUsize,
    out_buffer_size: AtomicUsize,
    persist_timeout_ms: AtomicU64,

    persist_map: Arc<PersistMap>,
    state: Mutex<LbState>,
    /// Running proxies keyed by acceptor loop alias.
    servers: DashMap<String, Arc<Proxy>>,
    attach: Arc<LbAttach>,
    proxy_events: Arc<LbProxyEvents>,
    me: Weak<TcpLb>,
}

impl TcpLb {
    /// Create a load balancer and attach it to `acceptor_group`. Nothing is
    /// bound until [`start`](Self::start).
    pub fn new(
        alias: impl Into<String>,
        acceptor_group: Arc<EventLoopGroup>,
        worker_group: Arc<EventLoopGroup>,
        bind_address: SocketAddr,
        backend: Arc<ServerGroup>,
        security: Arc<dyn SecurityPolicy>,
    ) -> Result<Arc<Self>, LbError> {
        let alias = alias.into();
        let lb = Arc::new_cyclic(|me: &Weak<TcpLb>| Self {
            attach: Arc::new(LbAttach {
                id: format!("TcpLb:{}", alias),
                lb: me.clone(),
            }),
            proxy_events: Arc::new(LbProxyEvents { lb: me.clone() }),
            alias,
            acceptor_group,
            worker_group,
            bind_address,
            backend,
            security,
            timeout_ms: AtomicU64::new(15 * 60 * 1000),
            in_buffer_size: AtomicUsize::new(16 * 1024),
            out_buffer_size: AtomicUsize::new(16 * 1024),
            persist_timeout_ms: AtomicU64::new(0),
            persist_map: Arc::new(DashMap::new()),
            state: Mutex::new(LbState {
                stopped: true,
                destroyed: false,
            }),
            servers: DashMap::new(),
            me: me.clone(),
        });
        lb.acceptor_group.attach_resource(lb.attach.clone())?;
        Ok(lb)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub fn backend(&self) -> &Arc<ServerGroup> {
        &self.backend
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// Bind a listener on every acceptor loop that has none yet.
    pub fn start(&self) -> Result<(), LbError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(LbError::closed(format!("tcp lb `{}`", self.alias)));
        }
        state.stopped = false;

        let loops = self.acceptor_group.list();
        if loops.is_empty() {
            tracing::debug!(lb = %self.alias, "No acceptor loop yet, will start when one is added");
            return Ok(());
        }

        for event_loop in loops {
            if event_loop.is_closed() || self.servers.contains_key(event_loop.alias()) {
                continue;
            }
            let server = BindServer::bind(self.bind_address)?;
            let local_addr = server.local_addr();
            let proxy = Proxy::new(local_addr, self.proxy_config(&event_loop), self.proxy_events.clone());
            // the bound socket is closed with `server` when handle() fails
            proxy.handle(server)?;
            self.servers.insert(event_loop.alias().to_string(), proxy);
            tracing::info!(lb = %self.alias, address = %local_addr, event_loop = %event_loop.alias(), "Listener started");
        }
        Ok(())
    }

    /// Close every listener and session and forget sticky entries. Restartable.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut LbState) {
        state.stopped = true;
        let proxies: Vec<Arc<Proxy>> = self.servers.iter().map(|e| e.value().clone()).collect();
        for proxy in &proxies {
            proxy.stop();
        }
        self.servers.clear();

        let entries: Vec<Arc<Persist>> = self.persist_map.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            entry.remove(&self.persist_map);
        }
        if !proxies.is_empty() {
            tracing::info!(lb = %self.alias, listeners = proxies.len(), "Load balancer stopped");
        }
    }

    /// Stop for good and detach from the acceptor group. Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = lock(&self.state);
            self.stop_locked(&mut state);
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        let _ = self.acceptor_group.detach_resource(&self.attach.id);
        tracing::info!(lb = %self.alias, "Load balancer destroyed");
    }

    fn proxy_config(&self, accept_loop: &EventLoop) -> ProxyNetConfig {
        let lb = self.me.clone();
        let connector_gen: ConnectorGen = Arc::new(move |client: &ClientInfo| lb.upgrade()?.provide_connector(client));
        let workers = self.worker_group.clone();
        let loop_provider: LoopProvider = Arc::new(move || workers.next());

        ProxyNetConfig::new(accept_loop.clone(), connector_gen, loop_provider)
            .with_timeout(self.timeout())
            .with_connect_timeout(self.backend.health_check_config().timeout())
            .with_buffer_sizes(self.in_buffer_size(), self.out_buffer_size())
    }

    /// Backend selection for one accepted client. Runs on the acceptor loop.
    fn provide_connector(&self, client: &ClientInfo) -> Option<Connector> {
        let ip = client.remote.ip();
        if !self.security.allow(Protocol::Tcp, ip, client.local.port()) {
            tracing::debug!(lb = %self.alias, client = %client.remote, "Client denied by security policy");
            metrics::record_rejected("security");
            return None;
        }

        let persist_timeout = self.persist_timeout();
        let existing = self.persist_map.get(&ip).map(|e| e.value().clone());
        if let Some(persist) = existing {
            if persist_timeout.is_zero() {
                persist.remove(&self.persist_map);
            } else if persist.connector().is_valid() {
                persist.refresh(&self.persist_map, persist_timeout);
                return Some(persist.connector().clone());
            } else {
                tracing::debug!(lb = %self.alias, client = %ip, "Sticky backend no longer valid");
                persist.remove(&self.persist_map);
            }
        }

        let Some(connector) = self.backend.next() else {
            tracing::debug!(lb = %self.alias, client = %client.remote, "No healthy backend");
            metrics::record_rejected("no_backend");
            return None;
        };
        tracing::trace!(lb = %self.alias, client = %client.remote, backend = %connector, "Backend selected");

        if !persist_timeout.is_zero() {
            let persist = Persist::new(ip, connector.clone());
            self.persist_map.insert(ip, persist.clone());
            persist.refresh(&self.persist_map, persist_timeout);
        }
        Some(connector)
    }

    /// Live sessions over every listener.
    pub fn session_count(&self) -> usize {
        self.servers.iter().map(|e| e.value().session_count()).sum()
    }

    pub fn copy_sessions(&self) -> Vec<SessionInfo> {
        self.servers
            .iter()
            .flat_map(|e| e.value().copy_sessions())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.servers.len()
    }

    /// Addresses actually bound, one per running listener.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.servers.iter().map(|e| e.value().local_addr()).collect()
    }

    pub fn persist_count(&self) -> usize {
        self.persist_map.len()
    }

    /// Backend currently pinned for `client`, if any.
    pub fn persisted(&self, client: std::net::IpAddr) -> Option<Connector> {
        self.persist_map.get(&client).map(|e| e.value().connector().clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
        for proxy in self.servers.iter() {
            proxy.config().set_timeout(timeout);
        }
    }

    pub fn in_buffer_size(&self) -> usize {
        self.in_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_in_buffer_size(&self, size: usize) {
        self.in_buffer_size.store(size, Ordering::Relaxed);
        for proxy in self.servers.iter() {
            proxy.config().set_in_buffer_size(size);
        }
    }

    pub fn out_buffer_size(&self) -> usize {
        self.out_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_out_buffer_size(&self, size: usize) {
        self.out_buffer_size.store(size, Ordering::Relaxed);
        for proxy in self.servers.iter() {
            proxy.config().set_out_buffer_size(size);
        }
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms.load(Ordering::Relaxed))
    }

    /// Sticky session idle timeout; zero disables stickiness.
    pub fn set_persist_timeout(&self, timeout: Duration) {
        self.persist_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for TcpLb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpLb")
            .field("alias", &self.alias)
            .field("bind_address", &self.bind_address)
            .field("backend", &self.backend.alias())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Drops a proxy from the table once it stops (explicitly or by loop closure).
struct LbProxyEvents {
    lb: Weak<TcpLb>,
}

impl ProxyEventHandler for LbProxyEvents {
    fn server_removed(&self, proxy: &Proxy) {
        let Some(lb) = self.lb.upgrade() else {
            return;
        };
        let removed = lb
            .servers
            .remove_if(proxy.accept_loop().alias(), |_, p| std::ptr::eq(p.as_ref(), proxy))
            .is_some();
        if removed {
            tracing::info!(lb = %lb.alias, proxy = %proxy, left = lb.servers.len(), "Listener removed from acceptor group");
        }
    }
}

struct LbAttach {
    id: String,
    lb: Weak<TcpLb>,
}

impl EventLoopGroupAttach for LbAttach {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn on_event_loop_add(&self) {
        let Some(lb) = self.lb.upgrade() else {
            return;
        };
        if lb.is_stopped() {
            return;
        }
        if let Err(e) = lb.start() {
            tracing::error!(lb = %lb.alias, error = %e, "Failed to start listener on new acceptor loop");
        }
    }

    fn on_close(&self) {
        if let Some(lb) = self.lb.upgrade() {
            lb.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;
    use crate::load_balancer::Method;
    use crate::security::AllowAll;

    fn running_lb(name: &str, acceptors: usize) -> (Arc<EventLoopGroup>, Arc<EventLoopGroup>, Arc<TcpLb>) {
        let acceptor_group = EventLoopGroup::with_threads(format!("{}-acceptor", name), acceptors).unwrap();
        let worker_group = EventLoopGroup::with_threads(format!("{}-worker", name), 1).unwrap();
        let check = HealthCheckConfig {
            timeout_ms: 250,
            ..HealthCheckConfig::default()
        };
        let group = ServerGroup::new(name, worker_group.clone(), check, Method::Wrr).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let lb = TcpLb::new(name, acceptor_group.clone(), worker_group.clone(), bind, group, Arc::new(AllowAll)).unwrap();
        lb.start().unwrap();
        (acceptor_group, worker_group, lb)
    }

    fn proxies(lb: &TcpLb) -> Vec<Arc<Proxy>> {
        lb.servers.iter().map(|e| e.value().clone()).collect()
    }

    #[test]
    fn test_setters_reach_bound_proxies() {
        let (acceptors, workers, lb) = running_lb("lb-setters", 2);
        assert_eq!(proxies(&lb).len(), 2);

        lb.set_timeout(Duration::from_secs(7));
        lb.set_in_buffer_size(1024);
        lb.set_out_buffer_size(2048);
        for proxy in proxies(&lb) {
            assert_eq!(proxy.config().timeout(), Duration::from_secs(7));
            assert_eq!(proxy.config().in_buffer_size(), 1024);
            assert_eq!(proxy.config().out_buffer_size(), 2048);
        }

        // listeners bound later start from the current values
        acceptors.add("lb-setters-acceptor-late").unwrap();
        let late = lb.servers.get("lb-setters-acceptor-late").unwrap().value().clone();
        assert_eq!(late.config().timeout(), Duration::from_secs(7));
        assert_eq!(late.config().in_buffer_size(), 1024);
        assert_eq!(late.config().out_buffer_size(), 2048);

        acceptors.close();
        workers.close();
    }

    #[test]
    fn test_connect_timeout_follows_health_check_timeout() {
        let (acceptors, workers, lb) = running_lb("lb-connect", 1);
        for proxy in proxies(&lb) {
            assert_eq!(proxy.config().connect_timeout(), Duration::from_millis(250));
            assert_eq!(proxy.config().timeout(), Duration::from_secs(15 * 60));
        }
        acceptors.close();
        workers.close();
    }
}
