//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lb_sessions_total` (counter): sessions spliced since start
//! - `lb_active_sessions` (gauge): sessions currently open
//! - `lb_rejected_total` (counter): accepted sockets closed early, by reason
//! - `lb_backend_bytes_total` (counter): bytes moved, by direction
//! - `lb_backend_health` (gauge): 1=UP, 0=DOWN, by group and server
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and serve scrapes on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            metrics::describe_counter!("lb_sessions_total", "Sessions established");
            metrics::describe_gauge!("lb_active_sessions", "Sessions currently open");
            metrics::describe_counter!("lb_rejected_total", "Client connections closed before splicing");
            metrics::describe_counter!("lb_backend_bytes_total", "Bytes exchanged with backends");
            metrics::describe_gauge!("lb_backend_health", "Backend health, 1 for UP");
            tracing::info!(address = %addr, "Metrics exporter listening");
        }
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_session_opened() {
    metrics::counter!("lb_sessions_total").increment(1);
    metrics::gauge!("lb_active_sessions").increment(1.0);
}

pub fn record_session_closed() {
    metrics::gauge!("lb_active_sessions").decrement(1.0);
}

/// `reason` is one of `security`, `no_backend`, `no_worker`, `connect_failed`.
pub fn record_rejected(reason: &'static str) {
    metrics::counter!("lb_rejected_total", "reason" => reason).increment(1);
}

pub fn record_backend_bytes(direction: &'static str, bytes: u64) {
    metrics::counter!("lb_backend_bytes_total", "direction" => direction).increment(bytes);
}

pub fn record_backend_health(group: &str, server: &str, healthy: bool) {
    metrics::gauge!(
        "lb_backend_health",
        "group" => group.to_string(),
        "server" => server.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}
