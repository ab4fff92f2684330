//! A single-threaded I/O loop.
//!
//! # Responsibilities
//! - Own one OS thread running a current-thread tokio runtime and a `LocalSet`
//! - Accept `Send` jobs from any thread and run them on the loop thread
//! - Schedule cancellable timers
//! - Track attached resources and notify them when the loop closes
//!
//! # Design Decisions
//! - Everything spawned by a job is a local task: connections and listeners
//!   never leave the thread that created them
//! - `EventLoop` is a cheap, cloneable, thread-safe handle

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::LocalSet;

use crate::error::LbError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Msg {
    Run(Job),
    Stop,
}

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// A resource bound to one loop, told when that loop goes away.
pub trait EventLoopAttach: Send + Sync {
    /// Identity used for attach/detach bookkeeping.
    fn id(&self) -> String;
    /// The loop closed. Called once, from the thread closing the loop.
    fn on_close(&self);
}

struct LoopInner {
    alias: String,
    tx: mpsc::UnboundedSender<Msg>,
    closed: AtomicBool,
    resources: Mutex<HashMap<String, Arc<dyn EventLoopAttach>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Handle to a running loop thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Spawn a new loop thread named after `alias`.
    pub fn spawn(alias: impl Into<String>) -> Result<Self, LbError> {
        let alias = alias.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            inner: Arc::new(LoopInner {
                alias: alias.clone(),
                tx,
                closed: AtomicBool::new(false),
                resources: Mutex::new(HashMap::new()),
                thread: Mutex::new(None),
            }),
        };

        let me = event_loop.clone();
        let join = thread::Builder::new()
            .name(alias.clone())
            .spawn(move || me.run(runtime, rx))?;
        *lock(&event_loop.inner.thread) = Some(join);

        tracing::debug!(event_loop = %alias, "Event loop started");
        Ok(event_loop)
    }

    fn run(self, runtime: tokio::runtime::Runtime, mut rx: mpsc::UnboundedReceiver<Msg>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));

        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Run(job) => job(),
                    Msg::Stop => break,
                }
            }
        });
        // pending local tasks (connections, timers) are dropped here
        drop(local);
        drop(runtime);

        CURRENT.with(|c| c.borrow_mut().take());
        tracing::debug!(event_loop = %self.inner.alias, "Event loop exited");
    }

    /// The loop driving the calling thread, if any.
    pub fn current() -> Option<EventLoop> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// True when called from this loop's own thread.
    pub fn in_loop(&self) -> bool {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|cur| Arc::ptr_eq(&cur.inner, &self.inner))
        })
    }

    pub fn same_loop(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `job` on the loop thread. Jobs run in submission order.
    pub fn run_on_loop<F>(&self, job: F) -> Result<(), LbError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner
            .tx
            .send(Msg::Run(Box::new(job)))
            .map_err(|_| self.closed_error())
    }

    /// Run `job` on the loop after `delay`, unless cancelled first.
    ///
    /// May be called from any thread; the timer itself always fires on the loop.
    pub fn delay<F>(&self, delay: Duration, job: F) -> Result<TimerEvent, LbError>
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = TimerEvent::new();
        let cancelled = timer.clone();
        let task = async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !cancelled.is_cancelled() {
                        job();
                    }
                }
                _ = cancelled.inner.notify.notified() => {}
            }
        };

        if self.in_loop() {
            tokio::task::spawn_local(task);
        } else {
            self.run_on_loop(move || {
                tokio::task::spawn_local(task);
            })?;
        }
        Ok(timer)
    }

    /// Register a resource to be notified when this loop closes.
    pub fn attach_resource(&self, resource: Arc<dyn EventLoopAttach>) -> Result<(), LbError> {
        let mut resources = lock(&self.inner.resources);
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let id = resource.id();
        if resources.contains_key(&id) {
            return Err(LbError::already_exists("loop resource", id));
        }
        resources.insert(id, resource);
        Ok(())
    }

    pub fn detach_resource(&self, id: &str) -> Result<(), LbError> {
        lock(&self.inner.resources)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| LbError::not_found("loop resource", id))
    }

    pub fn resource_count(&self) -> usize {
        lock(&self.inner.resources).len()
    }

    /// Stop the loop and notify every attached resource. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.send(Msg::Stop);

        let resources: Vec<_> = lock(&self.inner.resources)
            .drain()
            .map(|(_, r)| r)
            .collect();
        for resource in resources {
            tracing::debug!(event_loop = %self.inner.alias, resource = %resource.id(), "Notifying resource of loop close");
            resource.on_close();
        }

        if !self.in_loop() {
            if let Some(join) = lock(&self.inner.thread).take() {
                if join.join().is_err() {
                    tracing::error!(event_loop = %self.inner.alias, "Event loop thread panicked");
                }
            }
        }
        tracing::info!(event_loop = %self.inner.alias, "Event loop closed");
    }

    fn closed_error(&self) -> LbError {
        LbError::closed(format!("event loop `{}`", self.inner.alias))
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("alias", &self.inner.alias)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct TimerInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A pending [`EventLoop::delay`] job. Cancellable from any thread.
#[derive(Clone)]
pub struct TimerEvent {
    inner: Arc<TimerInner>,
}

impl TimerEvent {
    fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // stores a permit if the timer task has not started waiting yet
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEvent")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    struct Resource {
        id: String,
        closed: Arc<AtomicUsize>,
    }

    impl EventLoopAttach for Resource {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn on_close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn jobs_run_on_the_loop_thread_in_order() {
        let el = EventLoop::spawn("test-loop").unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            let probe = el.clone();
            el.run_on_loop(move || {
                let on_loop = probe.in_loop();
                let current = EventLoop::current().map(|l| l.alias().to_string());
                tx.send((i, on_loop, current)).unwrap();
            })
            .unwrap();
        }
        for i in 0..5 {
            let (n, on_loop, current) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(n, i);
            assert!(on_loop);
            assert_eq!(current.as_deref(), Some("test-loop"));
        }
        assert!(!el.in_loop());
        el.close();
    }

    #[test]
    fn timers_fire_unless_cancelled() {
        let el = EventLoop::spawn("timer-loop").unwrap();
        let (tx, rx) = std_mpsc::channel();

        let fired = tx.clone();
        el.delay(Duration::from_millis(20), move || fired.send("fired").unwrap())
            .unwrap();
        let cancelled = el
            .delay(Duration::from_millis(20), move || tx.send("cancelled").unwrap())
            .unwrap();
        cancelled.cancel();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "fired");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        el.close();
    }

    #[test]
    fn attach_rules_and_close_notification() {
        let el = EventLoop::spawn("attach-loop").unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let res = Arc::new(Resource {
            id: "r1".into(),
            closed: closed.clone(),
        });

        el.attach_resource(res.clone()).unwrap();
        assert!(matches!(
            el.attach_resource(res.clone()),
            Err(LbError::AlreadyExists { .. })
        ));
        el.detach_resource("r1").unwrap();
        assert!(matches!(
            el.detach_resource("r1"),
            Err(LbError::NotFound { .. })
        ));

        el.attach_resource(res.clone()).unwrap();
        el.close();
        el.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(el.resource_count(), 0);

        assert!(matches!(el.attach_resource(res), Err(LbError::Closed(_))));
        assert!(matches!(el.run_on_loop(|| {}), Err(LbError::Closed(_))));
    }
}
