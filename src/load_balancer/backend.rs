//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server inside a group
//! - Track active connections (for Weighted Least Connections) and byte counters
//! - Own the backend's health check and move it when its loop closes
//! - Drive the graceful replace protocol from health events
//!
//! # Replace protocol
//! ```text
//! add(alias, replace=true) with existing handle OLD
//!     OLD.logic_delete = true, NEW.to_logic_delete = OLD
//! NEW goes UP          → group removes OLD
//! NEW probe fails once → (OLD still in group) NEW.logic_delete = true,
//!                        OLD.logic_delete = false, group removes NEW
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::LbError;
use crate::event_loop::wrapper::lock;
use crate::event_loop::{EventLoop, EventLoopAttach};
use crate::health::{HealthCheckHandler, HealthState, TcpHealthCheckClient};
use crate::load_balancer::pool::ServerGroup;
use crate::net::{Connection, NetFlowRecorder};
use crate::observability::metrics;

struct CheckSlot {
    event_loop: EventLoop,
    client: TcpHealthCheckClient,
}

/// One backend server in a [`ServerGroup`].
pub struct ServerHandle {
    alias: String,
    sid: u64,
    group_alias: String,
    server: SocketAddr,
    weight: AtomicU32,

    /// Unhealthy until the first health check transition to UP.
    healthy: AtomicBool,
    /// Marked for removal by a replace in progress.
    logic_delete: AtomicBool,
    /// Cleared when the handle leaves its group.
    valid: AtomicBool,
    /// The handle this one replaces once it comes UP.
    to_logic_delete: Mutex<Option<Arc<ServerHandle>>>,

    group: Weak<ServerGroup>,
    me: Weak<ServerHandle>,
    check: Mutex<Option<CheckSlot>>,

    connections: AtomicUsize,
    from_remote_bytes: AtomicU64,
    to_remote_bytes: AtomicU64,
}

impl ServerHandle {
    pub(crate) fn new(
        group: Weak<ServerGroup>,
        group_alias: &str,
        alias: String,
        sid: u64,
        server: SocketAddr,
        weight: u32,
        to_logic_delete: Option<Arc<ServerHandle>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            alias,
            sid,
            group_alias: group_alias.to_string(),
            server,
            weight: AtomicU32::new(weight),
            healthy: AtomicBool::new(false),
            logic_delete: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            to_logic_delete: Mutex::new(to_logic_delete),
            group,
            me: me.clone(),
            check: Mutex::new(None),
            connections: AtomicUsize::new(0),
            from_remote_bytes: AtomicU64::new(0),
            to_remote_bytes: AtomicU64::new(0),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Group-unique serial number, distinguishes handles sharing an alias.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn store_weight(&self, weight: u32) -> bool {
        self.weight.swap(weight, Ordering::Relaxed) != weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn is_logic_delete(&self) -> bool {
        self.logic_delete.load(Ordering::Acquire)
    }

    pub(crate) fn set_logic_delete(&self, logic_delete: bool) {
        self.logic_delete.store(logic_delete, Ordering::Release);
    }

    /// False once the handle has been removed from its group.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Number of live backend connections made through this handle.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn from_remote_bytes(&self) -> u64 {
        self.from_remote_bytes.load(Ordering::Relaxed)
    }

    pub fn to_remote_bytes(&self) -> u64 {
        self.to_remote_bytes.load(Ordering::Relaxed)
    }

    /// Alias of the loop currently running this handle's health check.
    pub fn check_loop(&self) -> Option<String> {
        lock(&self.check)
            .as_ref()
            .map(|slot| slot.event_loop.alias().to_string())
    }

    /// The handle this one will replace, while a replace is pending.
    pub fn replacing(&self) -> Option<Arc<ServerHandle>> {
        lock(&self.to_logic_delete).clone()
    }

    /// Count one backend connection until the guard drops.
    pub fn track_connection(self: &Arc<Self>) -> ServerConnectionGuard {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ServerConnectionGuard {
            handle: self.clone(),
        }
    }

    /// Start the health check unless one is already running.
    pub(crate) fn start(self: &Arc<Self>) {
        if lock(&self.check).is_some() {
            return;
        }
        self.restart();
    }

    /// (Re)start the health check on a loop taken from the group.
    ///
    /// With no loop available the handle stays unscheduled until the group
    /// gains one and restarts it.
    pub(crate) fn restart(self: &Arc<Self>) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        if !self.is_valid() {
            return;
        }

        let (stopped, started) = {
            let mut slot = lock(&self.check);
            let stopped = slot.take().map(|old| self.release(old)).is_some();

            let attempts = group.event_loop_group().len() + 1;
            let mut started = None;
            for _ in 0..attempts {
                let Some(event_loop) = group.event_loop_group().next() else {
                    tracing::debug!(server = %self.alias, "No event loop for health check, waiting for one");
                    break;
                };
                match self.start_on(&group, &event_loop) {
                    Ok(client) => {
                        started = Some(event_loop.alias().to_string());
                        *slot = Some(CheckSlot { event_loop, client });
                        break;
                    }
                    Err(LbError::Closed(_)) => {
                        tracing::error!(server = %self.alias, event_loop = %event_loop.alias(), "should not happen: the retrieved event loop is closed");
                    }
                    Err(e) => {
                        tracing::error!(server = %self.alias, error = %e, "should not happen: health check could not be attached");
                        break;
                    }
                }
            }
            (stopped, started)
        };

        if stopped {
            group.alert(|l| l.on_stop(self));
        }
        if let Some(event_loop) = started {
            tracing::debug!(group = %self.group_alias, server = %self.alias, event_loop = %event_loop, "Health check running");
            group.alert(|l| l.on_start(self));
        }
    }

    fn start_on(self: &Arc<Self>, group: &ServerGroup, event_loop: &EventLoop) -> Result<TcpHealthCheckClient, LbError> {
        let initial = if self.is_healthy() {
            HealthState::Up
        } else {
            HealthState::Down
        };
        let events = Arc::new(HealthEvents {
            handle: Arc::downgrade(self),
        });
        let client = TcpHealthCheckClient::start(event_loop, self.server, group.health_check_config(), initial, events)?;
        if let Err(e) = event_loop.attach_resource(self.clone()) {
            client.stop();
            return Err(e);
        }
        Ok(client)
    }

    fn release(&self, slot: CheckSlot) {
        slot.client.stop();
        // already gone when the loop itself is closing
        let _ = slot.event_loop.detach_resource(&self.id());
    }

    /// Stop the health check for good. The handle is no longer selectable.
    pub(crate) fn stop(&self) {
        self.valid.store(false, Ordering::Release);
        let slot = lock(&self.check).take();
        if let Some(slot) = slot {
            self.release(slot);
            if let (Some(group), Some(me)) = (self.group.upgrade(), self.me.upgrade()) {
                group.alert(|l| l.on_stop(&me));
            }
        }
        lock(&self.to_logic_delete).take();
    }
}

impl EventLoopAttach for ServerHandle {
    fn id(&self) -> String {
        format!("HealthCheck({}/{}({}))", self.group_alias, self.alias, self.sid)
    }

    fn on_close(&self) {
        {
            let mut slot = lock(&self.check);
            if slot.as_ref().is_some_and(|s| !s.event_loop.is_closed()) {
                // a concurrent restart already moved the check
                return;
            }
            slot.take();
        }
        tracing::debug!(group = %self.group_alias, server = %self.alias, "Health check loop closed, restarting");
        if let Some(me) = self.me.upgrade() {
            me.restart();
        }
    }
}

impl NetFlowRecorder for ServerHandle {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.from_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::record_backend_bytes("from_backend", bytes);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.to_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::record_backend_bytes("to_backend", bytes);
    }
}

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} -> connect to {}:{} weight {} currently {}",
            if self.is_logic_delete() { "*" } else { "" },
            self.alias,
            self.server.ip(),
            self.server.port(),
            self.weight(),
            if self.is_healthy() { "UP" } else { "DOWN" }
        )
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("alias", &self.alias)
            .field("sid", &self.sid)
            .field("server", &self.server)
            .field("weight", &self.weight())
            .field("healthy", &self.is_healthy())
            .field("logic_delete", &self.is_logic_delete())
            .finish()
    }
}

/// Health check callbacks for one handle.
struct HealthEvents {
    handle: Weak<ServerHandle>,
}

impl HealthEvents {
    fn target(&self) -> Option<(Arc<ServerHandle>, Arc<ServerGroup>)> {
        let handle = self.handle.upgrade()?;
        let group = handle.group.upgrade()?;
        Some((handle, group))
    }
}

impl HealthCheckHandler for HealthEvents {
    fn up(&self) {
        let Some((handle, group)) = self.target() else {
            return;
        };
        handle.set_healthy(true);
        tracing::info!(group = %group.alias(), server = %handle.alias, addr = %handle.server, "Server status changed to UP");
        metrics::record_backend_health(group.alias(), &handle.alias, true);

        let replaced = lock(&handle.to_logic_delete).take();
        if let Some(old) = replaced {
            tracing::debug!(group = %group.alias(), server = %handle.alias, "Removing replaced server");
            group.remove_handle(&old);
        }
        group.alert(|l| l.on_up(&handle));
    }

    fn down(&self) {
        let Some((handle, group)) = self.target() else {
            return;
        };
        handle.set_healthy(false);
        tracing::info!(group = %group.alias(), server = %handle.alias, addr = %handle.server, "Server status changed to DOWN");
        metrics::record_backend_health(group.alias(), &handle.alias, false);
        group.alert(|l| l.on_down(&handle));
    }

    fn up_once(&self) {
        if let Some(handle) = self.handle.upgrade() {
            tracing::trace!(server = %handle.alias, "Health probe succeeded");
        }
    }

    fn down_once(&self) {
        let Some((handle, group)) = self.target() else {
            return;
        };
        tracing::trace!(server = %handle.alias, "Health probe failed");

        // a new handle starts DOWN, so one failure means the replacement is not reachable
        let replaced = lock(&handle.to_logic_delete).take();
        if let Some(old) = replaced {
            group.rollback_replace(&handle, &old);
        }
    }
}

/// A selected backend, resolved to an address when the proxy connects.
#[derive(Clone, Debug)]
pub struct Connector {
    handle: Arc<ServerHandle>,
}

impl Connector {
    pub(crate) fn new(handle: Arc<ServerHandle>) -> Self {
        Self { handle }
    }

    pub fn remote(&self) -> SocketAddr {
        self.handle.server
    }

    pub fn handle(&self) -> &Arc<ServerHandle> {
        &self.handle
    }

    /// True while the backend is in its group and UP.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid() && self.handle.is_healthy()
    }

    /// Account the established backend connection to this handle.
    pub fn connected(&self, conn: &Connection) {
        let guard = self.handle.track_connection();
        conn.add_close_handler(move |_| drop(guard));
        conn.add_net_flow_recorder(self.handle.clone());
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connector({}, {})", self.handle.alias, self.handle.server)
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct ServerConnectionGuard {
    handle: Arc<ServerHandle>,
}

impl Deref for ServerConnectionGuard {
    type Target = ServerHandle;
    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ServerConnectionGuard {
    fn drop(&mut self) {
        self.handle.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn handle(alias: &str, port: u16, weight: u32, healthy: bool) -> Arc<ServerHandle> {
        let h = ServerHandle::new(
            Weak::new(),
            "test",
            alias.to_string(),
            port as u64,
            SocketAddr::from(([127, 0, 0, 1], port)),
            weight,
            None,
        );
        h.set_healthy(healthy);
        h
    }

    #[test]
    fn test_display_marks_state() {
        let h = handle("web1", 8080, 10, true);
        assert_eq!(h.to_string(), "web1 -> connect to 127.0.0.1:8080 weight 10 currently UP");
        h.set_healthy(false);
        h.set_logic_delete(true);
        assert_eq!(h.to_string(), "*web1 -> connect to 127.0.0.1:8080 weight 10 currently DOWN");
    }

    #[test]
    fn test_connection_guard_counts() {
        let h = handle("a", 1, 1, true);
        let g1 = h.track_connection();
        let g2 = h.track_connection();
        assert_eq!(h.connection_count(), 2);
        assert_eq!(g1.alias(), "a");
        drop(g1);
        assert_eq!(h.connection_count(), 1);
        drop(g2);
        assert_eq!(h.connection_count(), 0);
    }

    #[test]
    fn test_connector_validity_follows_handle() {
        let h = handle("a", 1, 1, false);
        let c = Connector::new(h.clone());
        assert!(!c.is_valid());
        h.set_healthy(true);
        assert!(c.is_valid());
        h.stop();
        assert!(!c.is_valid());
    }

    #[test]
    fn test_byte_counters() {
        let h = handle("a", 1, 1, true);
        h.inc_from_remote_bytes(10);
        h.inc_to_remote_bytes(3);
        h.inc_to_remote_bytes(4);
        assert_eq!(h.from_remote_bytes(), 10);
        assert_eq!(h.to_remote_bytes(), 7);
    }
}
