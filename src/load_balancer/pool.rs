//! Backend group management.
//!
//! # Responsibilities
//! - Own a named list of ServerHandles (copy-on-write, read lock-free)
//! - Rebuild the selection state when membership, weight or method changes
//! - Spread health checks over the group's event loops
//! - Dispatch server events to registered listeners

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;

use crate::config::HealthCheckConfig;
use crate::error::LbError;
use crate::event_loop::wrapper::lock;
use crate::event_loop::{EventLoopGroup, EventLoopGroupAttach};
use crate::load_balancer::{
    backend::{Connector, ServerHandle},
    least_conn::WeightedLeastConnections,
    round_robin::WeightedRoundRobin,
    LoadBalancer, Method,
};

/// Observer of server lifecycle events. Every callback defaults to a no-op.
pub trait ServerListener: Send + Sync {
    /// Health check started on a loop.
    fn on_start(&self, _handle: &Arc<ServerHandle>) {}
    /// Health check stopped.
    fn on_stop(&self, _handle: &Arc<ServerHandle>) {}
    fn on_up(&self, _handle: &Arc<ServerHandle>) {}
    fn on_down(&self, _handle: &Arc<ServerHandle>) {}
}

#[derive(Debug)]
struct Selection {
    wrr: WeightedRoundRobin,
    wlc: WeightedLeastConnections,
}

impl Selection {
    fn build(servers: &[Arc<ServerHandle>]) -> Self {
        Self {
            wrr: WeightedRoundRobin::new(servers),
            wlc: WeightedLeastConnections::new(servers),
        }
    }
}

/// A named pool of backends with a selection method.
pub struct ServerGroup {
    alias: String,
    event_loop_group: Arc<EventLoopGroup>,
    health_check: Mutex<HealthCheckConfig>,
    method: Mutex<Method>,

    servers: ArcSwap<Vec<Arc<ServerHandle>>>,
    selection: ArcSwap<Selection>,
    listeners: ArcSwap<Vec<Arc<dyn ServerListener>>>,
    /// Serializes every change to `servers`.
    write: Mutex<()>,

    next_sid: AtomicU64,
    attach: Arc<GroupAttach>,
    destroyed: AtomicBool,
    me: Weak<ServerGroup>,
}

impl ServerGroup {
    /// Create a group whose health checks run on `event_loop_group`.
    pub fn new(
        alias: impl Into<String>,
        event_loop_group: Arc<EventLoopGroup>,
        health_check: HealthCheckConfig,
        method: Method,
    ) -> Result<Arc<Self>, LbError> {
        let alias = alias.into();
        let group = Arc::new_cyclic(|me: &Weak<ServerGroup>| Self {
            attach: Arc::new(GroupAttach {
                id: format!("ServerGroup:{}", alias),
                group: me.clone(),
            }),
            alias,
            event_loop_group,
            health_check: Mutex::new(health_check),
            method: Mutex::new(method),
            servers: ArcSwap::from_pointee(Vec::new()),
            selection: ArcSwap::from_pointee(Selection::build(&[])),
            listeners: ArcSwap::from_pointee(Vec::new()),
            write: Mutex::new(()),
            next_sid: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            me: me.clone(),
        });
        group.event_loop_group.attach_resource(group.attach.clone())?;
        tracing::info!(group = %group.alias, method = %method, "Server group created");
        Ok(group)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn event_loop_group(&self) -> &Arc<EventLoopGroup> {
        &self.event_loop_group
    }

    pub fn health_check_config(&self) -> HealthCheckConfig {
        *lock(&self.health_check)
    }

    pub fn method(&self) -> Method {
        *lock(&self.method)
    }

    /// Pick a healthy backend with the group's method.
    pub fn next(&self) -> Option<Connector> {
        let selection = self.selection.load();
        let picked = match self.method() {
            Method::Wrr => selection.wrr.next_server(),
            Method::Wlc => selection.wlc.next_server(),
        };
        picked.map(Connector::new)
    }

    /// Add a backend. Fails if a live backend already uses `alias`.
    pub fn add(&self, alias: impl Into<String>, server: SocketAddr, weight: u32) -> Result<Arc<ServerHandle>, LbError> {
        let handle = {
            let guard = lock(&self.write);
            self.add_locked(&guard, alias.into(), server, weight, false)?
        };
        handle.start();
        Ok(handle)
    }

    /// Add a backend, gracefully replacing a live one with the same alias.
    ///
    /// The old backend is removed once the new one is UP; if the new one
    /// fails a probe first, it is removed and the old one stays.
    pub fn add_with_replace(&self, alias: impl Into<String>, server: SocketAddr, weight: u32) -> Result<Arc<ServerHandle>, LbError> {
        let handle = {
            let guard = lock(&self.write);
            self.add_locked(&guard, alias.into(), server, weight, true)?
        };
        handle.start();
        Ok(handle)
    }

    /// Replace the ip of a live backend, keeping its port and weight.
    pub fn replace_ip(&self, alias: &str, ip: IpAddr) -> Result<Arc<ServerHandle>, LbError> {
        let handle = {
            let guard = lock(&self.write);
            let current = self
                .servers
                .load()
                .iter()
                .find(|h| h.alias() == alias && !h.is_logic_delete())
                .cloned()
                .ok_or_else(|| LbError::not_found("server", alias))?;
            let server = SocketAddr::new(ip, current.server().port());
            self.add_locked(&guard, alias.to_string(), server, current.weight(), true)?
        };
        handle.start();
        Ok(handle)
    }

    fn add_locked(
        &self,
        _write: &std::sync::MutexGuard<'_, ()>,
        alias: String,
        server: SocketAddr,
        weight: u32,
        replace: bool,
    ) -> Result<Arc<ServerHandle>, LbError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(LbError::closed(format!("server group `{}`", self.alias)));
        }
        let current = self.servers.load_full();
        let existing = current
            .iter()
            .find(|h| h.alias() == alias && !h.is_logic_delete())
            .cloned();
        if existing.is_some() && !replace {
            return Err(LbError::already_exists("server", alias));
        }
        if let Some(old) = &existing {
            old.set_logic_delete(true);
        }

        let handle = ServerHandle::new(
            self.me.clone(),
            &self.alias,
            alias,
            self.next_sid.fetch_add(1, Ordering::Relaxed),
            server,
            weight,
            existing,
        );
        let mut next = current.as_ref().clone();
        next.push(handle.clone());
        self.store_servers(next);

        tracing::info!(group = %self.alias, server = %handle.alias(), addr = %server, weight, replace, "Server added");
        Ok(handle)
    }

    /// Remove every backend named `alias`, including one being replaced.
    pub fn remove(&self, alias: &str) -> Result<(), LbError> {
        let removed = {
            let _w = lock(&self.write);
            let (removed, kept): (Vec<_>, Vec<_>) = self
                .servers
                .load()
                .iter()
                .cloned()
                .partition(|h| h.alias() == alias);
            if removed.is_empty() {
                return Err(LbError::not_found("server", alias));
            }
            self.store_servers(kept);
            removed
        };
        for handle in removed {
            handle.stop();
        }
        tracing::info!(group = %self.alias, server = %alias, "Server removed");
        Ok(())
    }

    /// Remove exactly this handle. Silently ignores handles no longer present.
    pub(crate) fn remove_handle(&self, handle: &Arc<ServerHandle>) {
        let found = {
            let _w = lock(&self.write);
            self.take_handle(handle)
        };
        if found {
            handle.stop();
            tracing::debug!(group = %self.alias, server = %handle.alias(), sid = handle.sid(), "Server handle removed");
        }
    }

    /// A replacement failed its first probe: keep `old`, drop `new`.
    pub(crate) fn rollback_replace(&self, new: &Arc<ServerHandle>, old: &Arc<ServerHandle>) {
        let rolled_back = {
            let _w = lock(&self.write);
            if !self.servers.load().iter().any(|h| Arc::ptr_eq(h, old)) {
                false
            } else {
                new.set_logic_delete(true);
                old.set_logic_delete(false);
                self.take_handle(new)
            }
        };
        if rolled_back {
            new.stop();
            tracing::info!(group = %self.alias, server = %new.alias(), addr = %new.server(), "Replacement unreachable, keeping original server");
        }
    }

    fn take_handle(&self, handle: &Arc<ServerHandle>) -> bool {
        let current = self.servers.load();
        if !current.iter().any(|h| Arc::ptr_eq(h, handle)) {
            return false;
        }
        let next = current.iter().filter(|h| !Arc::ptr_eq(h, handle)).cloned().collect();
        self.store_servers(next);
        true
    }

    /// Change the weight of the live backend named `alias`.
    pub fn set_weight(&self, alias: &str, weight: u32) -> Result<(), LbError> {
        let _w = lock(&self.write);
        let servers = self.servers.load();
        let handle = servers
            .iter()
            .find(|h| h.alias() == alias && !h.is_logic_delete())
            .ok_or_else(|| LbError::not_found("server", alias))?;
        if handle.store_weight(weight) {
            self.reset_selection();
            tracing::info!(group = %self.alias, server = %alias, weight, "Server weight changed");
        }
        Ok(())
    }

    pub fn set_method(&self, method: Method) {
        let _w = lock(&self.write);
        let changed = {
            let mut current = lock(&self.method);
            let changed = *current != method;
            *current = method;
            changed
        };
        if changed {
            self.reset_selection();
            tracing::info!(group = %self.alias, method = %method, "Selection method changed");
        }
    }

    /// Apply new health check settings by restarting every check.
    pub fn set_health_check_config(&self, config: HealthCheckConfig) {
        *lock(&self.health_check) = config;
        for handle in self.servers.load().iter() {
            handle.restart();
        }
    }

    /// Snapshot of every handle, logic-deleted ones included.
    pub fn server_handles(&self) -> Vec<Arc<ServerHandle>> {
        self.servers.load().as_ref().clone()
    }

    pub fn add_server_listener(&self, listener: Arc<dyn ServerListener>) {
        self.listeners.rcu(|current| {
            let mut next = current.as_ref().clone();
            next.push(listener.clone());
            next
        });
    }

    pub(crate) fn alert<F>(&self, event: F)
    where
        F: Fn(&dyn ServerListener),
    {
        for listener in self.listeners.load().iter() {
            event(listener.as_ref());
        }
    }

    /// Remove and stop every backend.
    pub fn clear(&self) {
        let removed = {
            let _w = lock(&self.write);
            let removed = self.servers.load_full();
            self.store_servers(Vec::new());
            removed
        };
        for handle in removed.iter() {
            handle.stop();
        }
        tracing::debug!(group = %self.alias, removed = removed.len(), "Server group cleared");
    }

    /// Clear the group and detach it from its event loops. Terminal.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear();
        let _ = self.event_loop_group.detach_resource(&self.attach.id);
        tracing::info!(group = %self.alias, "Server group destroyed");
    }

    fn store_servers(&self, servers: Vec<Arc<ServerHandle>>) {
        self.servers.store(Arc::new(servers));
        self.reset_selection();
    }

    fn reset_selection(&self) {
        let servers = self.servers.load();
        self.selection.store(Arc::new(Selection::build(&servers)));
    }
}

impl fmt::Debug for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerGroup")
            .field("alias", &self.alias)
            .field("method", &self.method())
            .field("servers", &self.servers.load().len())
            .finish()
    }
}

/// Restarts health checks when the event loop group grows, so checks spread
/// over the new loops too.
struct GroupAttach {
    id: String,
    group: Weak<ServerGroup>,
}

impl EventLoopGroupAttach for GroupAttach {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn on_event_loop_add(&self) {
        if let Some(group) = self.group.upgrade() {
            tracing::debug!(group = %group.alias, "Event loop added, restarting health checks");
            for handle in group.servers.load().iter() {
                handle.restart();
            }
        }
    }

    fn on_close(&self) {
        // handles are restarted or dropped as each loop closes
    }
}
