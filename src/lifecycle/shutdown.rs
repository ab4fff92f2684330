//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};

use tokio::sync::broadcast;

use crate::config::ObservabilityConfig;
use crate::event_loop::wrapper::lock;
use crate::observability::{logging, metrics};

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

type TeardownHook = Box<dyn FnOnce() + Send>;

static OBSERVABILITY: Once = Once::new();

/// Process-wide context: shutdown signal plus teardown hooks.
///
/// Hooks run in reverse registration order, exactly once.
#[derive(Default)]
pub struct AppContext {
    shutdown: Shutdown,
    hooks: Mutex<Vec<TeardownHook>>,
    torn_down: AtomicBool,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install logging and, when enabled, the metrics exporter. Only the first
    /// call in the process has any effect.
    pub fn init_observability(config: &ObservabilityConfig) {
        OBSERVABILITY.call_once(|| {
            logging::init_logging(&config.log_level);
            if !config.metrics_enabled {
                return;
            }
            match config.metrics_address.parse() {
                Ok(addr) => metrics::init_metrics(addr),
                Err(e) => tracing::error!(
                    metrics_address = %config.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                ),
            }
        });
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Register work for teardown. Runs immediately when teardown already happened.
    pub fn on_teardown<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_torn_down() {
            hook();
            return;
        }
        lock(&self.hooks).push(Box::new(hook));
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Run every hook, then signal shutdown to subscribers. Later calls do nothing.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *lock(&self.hooks));
        tracing::info!(hooks = hooks.len(), "Tearing down");
        for hook in hooks.into_iter().rev() {
            hook();
        }
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_teardown_runs_hooks_once_in_reverse() {
        let ctx = AppContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            ctx.on_teardown(move || order.lock().unwrap().push(i));
        }
        ctx.teardown();
        ctx.teardown();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(ctx.is_torn_down());
    }

    #[test]
    fn test_hook_after_teardown_runs_immediately() {
        let ctx = AppContext::new();
        ctx.teardown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        ctx.on_teardown(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_signal_follows_hooks() {
        let ctx = Arc::new(AppContext::new());
        let mut rx = ctx.shutdown().subscribe();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        ctx.on_teardown(move || flag.store(true, Ordering::SeqCst));

        let signal_ctx = ctx.clone();
        tokio::spawn(async move { signal_ctx.teardown() });
        assert!(rx.recv().await.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_teardown_triggers_shutdown_signal() {
        let ctx = AppContext::new();
        let mut rx = ctx.shutdown().subscribe();
        ctx.teardown();
        assert!(rx.recv().await.is_ok());
    }
}
