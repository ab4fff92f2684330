//! Sticky session entries.
//!
//! An entry pins a client ip to a backend until it has been idle for the
//! persist timeout. Refresh, expiry and removal of an entry serialize on the
//! entry's own lock; an expiry only ever removes the entry that scheduled it.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;

use crate::event_loop::wrapper::lock;
use crate::event_loop::{EventLoop, TimerEvent};
use crate::load_balancer::Connector;

#[derive(Default)]
struct PersistState {
    timer: Option<TimerEvent>,
    generation: u64,
    removed: bool,
}

/// One client ip → backend binding.
pub struct Persist {
    client: IpAddr,
    connector: Connector,
    state: Mutex<PersistState>,
}

pub(crate) type PersistMap = DashMap<IpAddr, Arc<Persist>>;

impl Persist {
    pub(crate) fn new(client: IpAddr, connector: Connector) -> Arc<Self> {
        Arc::new(Self {
            client,
            connector,
            state: Mutex::new(PersistState::default()),
        })
    }

    pub fn client(&self) -> IpAddr {
        self.client
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Restart the idle timer on the current loop.
    ///
    /// Without a loop context the entry cannot expire, so it is dropped instead.
    pub(crate) fn refresh(self: &Arc<Self>, map: &Arc<PersistMap>, timeout: Duration) {
        let mut state = lock(&self.state);
        if state.removed {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }

        let Some(event_loop) = EventLoop::current() else {
            state.removed = true;
            drop(state);
            self.unlink(map);
            tracing::debug!(client = %self.client, "No loop for sticky session timer, dropping entry");
            return;
        };

        state.generation += 1;
        let generation = state.generation;
        let entry = Arc::downgrade(self);
        let owner = Arc::downgrade(map);
        match event_loop.delay(timeout, move || expire(entry, owner, generation)) {
            Ok(timer) => state.timer = Some(timer),
            Err(e) => {
                state.removed = true;
                drop(state);
                self.unlink(map);
                tracing::error!(client = %self.client, error = %e, "should not happen: current loop rejected sticky session timer");
            }
        }
    }

    /// Cancel the timer and drop the entry from `map`.
    pub(crate) fn remove(self: &Arc<Self>, map: &PersistMap) {
        let mut state = lock(&self.state);
        if state.removed {
            return;
        }
        state.removed = true;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        self.unlink(map);
    }

    fn unlink(self: &Arc<Self>, map: &PersistMap) {
        map.remove_if(&self.client, |_, current| Arc::ptr_eq(current, self));
    }
}

fn expire(entry: Weak<Persist>, map: Weak<PersistMap>, generation: u64) {
    let (Some(entry), Some(map)) = (entry.upgrade(), map.upgrade()) else {
        return;
    };
    let mut state = lock(&entry.state);
    if state.removed || state.generation != generation {
        return;
    }
    state.removed = true;
    state.timer = None;
    entry.unlink(&map);
    tracing::debug!(client = %entry.client, backend = %entry.connector.remote(), "Sticky session expired");
}
