//! A named, growable pool of event loops.
//!
//! # Responsibilities
//! - Hand out loops round robin (`next`)
//! - Add and remove loops at runtime
//! - Notify attached components when a loop joins or the group closes

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::error::LbError;
use crate::event_loop::wrapper::{lock, EventLoop};

/// A component that spreads work over the loops of a group.
pub trait EventLoopGroupAttach: Send + Sync {
    fn id(&self) -> String;
    /// A loop joined the group.
    fn on_event_loop_add(&self);
    /// The group closed.
    fn on_close(&self);
}

/// Pool of [`EventLoop`]s.
pub struct EventLoopGroup {
    alias: String,
    /// Copy-on-write member list, read lock-free by `next()`.
    loops: ArcSwap<Vec<EventLoop>>,
    cursor: AtomicUsize,
    attaches: Mutex<HashMap<String, Arc<dyn EventLoopGroupAttach>>>,
    /// Serializes membership changes.
    membership: Mutex<()>,
    closed: AtomicBool,
}

impl EventLoopGroup {
    pub fn new(alias: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            alias: alias.into(),
            loops: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
            attaches: Mutex::new(HashMap::new()),
            membership: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a group with `threads` loops named `{alias}-{n}`.
    pub fn with_threads(alias: impl Into<String>, threads: usize) -> Result<Arc<Self>, LbError> {
        let group = Self::new(alias);
        for n in 0..threads {
            group.add(format!("{}-{}", group.alias, n))?;
        }
        Ok(group)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next open loop, round robin. `None` when the group has no open loop.
    pub fn next(&self) -> Option<EventLoop> {
        let loops = self.loops.load();
        let len = loops.len();
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = &loops[idx];
            if !candidate.is_closed() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Snapshot of the current members.
    pub fn list(&self) -> Vec<EventLoop> {
        self.loops.load().as_ref().clone()
    }

    pub fn get(&self, alias: &str) -> Option<EventLoop> {
        self.loops.load().iter().find(|l| l.alias() == alias).cloned()
    }

    pub fn len(&self) -> usize {
        self.loops.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a new loop and add it to the group, then notify attachments.
    pub fn add(&self, alias: impl Into<String>) -> Result<EventLoop, LbError> {
        let alias = alias.into();
        let event_loop = {
            let _guard = lock(&self.membership);
            if self.is_closed() {
                return Err(self.closed_error());
            }
            if self.get(&alias).is_some() {
                return Err(LbError::already_exists("event loop", alias));
            }
            let event_loop = EventLoop::spawn(alias)?;
            let mut members = self.list();
            members.push(event_loop.clone());
            self.loops.store(Arc::new(members));
            event_loop
        };

        tracing::info!(group = %self.alias, event_loop = %event_loop.alias(), "Event loop added");
        for attach in self.attach_snapshot() {
            attach.on_event_loop_add();
        }
        Ok(event_loop)
    }

    /// Remove a loop from the group and close it.
    pub fn remove(&self, alias: &str) -> Result<(), LbError> {
        let removed = {
            let _guard = lock(&self.membership);
            let mut members = self.list();
            let idx = members
                .iter()
                .position(|l| l.alias() == alias)
                .ok_or_else(|| LbError::not_found("event loop", alias))?;
            let removed = members.remove(idx);
            self.loops.store(Arc::new(members));
            removed
        };
        // the member list no longer offers this loop to resources restarting elsewhere
        removed.close();
        tracing::info!(group = %self.alias, event_loop = %alias, "Event loop removed");
        Ok(())
    }

    pub fn attach_resource(&self, attach: Arc<dyn EventLoopGroupAttach>) -> Result<(), LbError> {
        let mut attaches = lock(&self.attaches);
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let id = attach.id();
        if attaches.contains_key(&id) {
            return Err(LbError::already_exists("group resource", id));
        }
        attaches.insert(id, attach);
        Ok(())
    }

    pub fn detach_resource(&self, id: &str) -> Result<(), LbError> {
        lock(&self.attaches)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| LbError::not_found("group resource", id))
    }

    /// Close every loop and notify attachments. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let members = {
            let _guard = lock(&self.membership);
            let members = self.list();
            self.loops.store(Arc::new(Vec::new()));
            members
        };
        for event_loop in members {
            event_loop.close();
        }

        let attaches: Vec<_> = lock(&self.attaches).drain().map(|(_, a)| a).collect();
        for attach in attaches {
            attach.on_close();
        }
        tracing::info!(group = %self.alias, "Event loop group closed");
    }

    fn attach_snapshot(&self) -> Vec<Arc<dyn EventLoopGroupAttach>> {
        lock(&self.attaches).values().cloned().collect()
    }

    fn closed_error(&self) -> LbError {
        LbError::closed(format!("event loop group `{}`", self.alias))
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("alias", &self.alias)
            .field("loops", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        added: AtomicUsize,
        closed: AtomicUsize,
    }

    impl EventLoopGroupAttach for Counter {
        fn id(&self) -> String {
            "counter".into()
        }
        fn on_event_loop_add(&self) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn next_rotates_over_members() {
        let group = EventLoopGroup::with_threads("rr", 3).unwrap();
        let picks: Vec<String> = (0..6)
            .map(|_| group.next().unwrap().alias().to_string())
            .collect();
        assert_eq!(picks[0..3], picks[3..6]);
        let mut distinct = picks[0..3].to_vec();
        distinct.sort();
        assert_eq!(distinct, vec!["rr-0", "rr-1", "rr-2"]);
        group.close();
    }

    #[test]
    fn empty_group_has_no_next() {
        let group = EventLoopGroup::new("empty");
        assert!(group.next().is_none());
        assert!(group.is_empty());
    }

    #[test]
    fn membership_changes_notify_attachments() {
        let group = EventLoopGroup::new("members");
        let counter = Arc::new(Counter::default());
        group.attach_resource(counter.clone()).unwrap();

        group.add("members-a").unwrap();
        group.add("members-b").unwrap();
        assert_eq!(counter.added.load(Ordering::SeqCst), 2);
        assert!(matches!(
            group.add("members-a"),
            Err(LbError::AlreadyExists { .. })
        ));

        group.remove("members-a").unwrap();
        assert_eq!(group.len(), 1);
        assert!(matches!(
            group.remove("members-a"),
            Err(LbError::NotFound { .. })
        ));

        group.close();
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(group.add("late"), Err(LbError::Closed(_))));
    }
}
