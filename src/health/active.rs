//! Active TCP health checking.
//!
//! # Responsibilities
//! - Periodically try a TCP connect to one backend from an event loop
//! - Report every result (`up_once`/`down_once`) and every transition (`up`/`down`)
//!
//! The probe task lives on the loop it was started on; closing that loop
//! drops the task, and the owner restarts it elsewhere.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::error::LbError;
use crate::event_loop::EventLoop;
use crate::health::state::{CheckState, HealthState};

/// Receives probe results for one backend. Called on the check's loop.
pub trait HealthCheckHandler: Send + Sync {
    /// Transitioned to UP.
    fn up(&self);
    /// Transitioned to DOWN.
    fn down(&self);
    /// One successful probe.
    fn up_once(&self);
    /// One failed probe.
    fn down_once(&self);
}

/// A running periodic TCP-connect check. Dropping it stops the check.
#[derive(Debug)]
pub struct TcpHealthCheckClient {
    target: SocketAddr,
    event_loop: EventLoop,
    stop: watch::Sender<bool>,
}

impl TcpHealthCheckClient {
    /// Start probing `target` on `event_loop`.
    pub fn start(
        event_loop: &EventLoop,
        target: SocketAddr,
        config: HealthCheckConfig,
        initial: HealthState,
        handler: Arc<dyn HealthCheckHandler>,
    ) -> Result<Self, LbError> {
        let (stop, stop_rx) = watch::channel(false);
        event_loop.run_on_loop(move || {
            tokio::task::spawn_local(run_checks(target, config, initial, handler, stop_rx));
        })?;
        tracing::debug!(target = %target, event_loop = %event_loop.alias(), "Health check started");
        Ok(Self {
            target,
            event_loop: event_loop.clone(),
            stop,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

fn stopped(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

async fn run_checks(
    target: SocketAddr,
    config: HealthCheckConfig,
    initial: HealthState,
    handler: Arc<dyn HealthCheckHandler>,
    mut stop: watch::Receiver<bool>,
) {
    let mut state = CheckState::new(initial);
    let mut ticker = time::interval(config.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if stopped(&stop) {
            break;
        }

        let ok = tokio::select! {
            ok = probe(target, config.timeout()) => ok,
            _ = stop.changed() => break,
        };
        if stopped(&stop) {
            break;
        }

        if ok {
            handler.up_once();
        } else {
            handler.down_once();
        }
        // a once-callback may remove the backend and stop this check
        if stopped(&stop) {
            break;
        }

        match state.record(ok, config.up, config.down) {
            Some(HealthState::Up) => handler.up(),
            Some(HealthState::Down) => handler.down(),
            None => {}
        }
    }
    tracing::trace!(target = %target, "Health check task exited");
}

async fn probe(target: SocketAddr, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::trace!(target = %target, error = %e, "Health probe failed");
            false
        }
        Err(_) => {
            tracing::trace!(target = %target, "Health probe timed out");
            false
        }
    }
}
