//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the load balancer.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load_balancer::Method;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LbConfig {
    /// Acceptor/worker thread counts.
    pub event_loops: EventLoopConfig,

    /// Health check settings applied to groups without their own.
    pub health_check: HealthCheckConfig,

    /// Backend groups.
    pub server_groups: Vec<ServerGroupConfig>,

    /// Listening load balancers.
    pub load_balancers: Vec<TcpLbConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Event loop pool sizes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Loops accepting client connections; one listening socket each.
    pub acceptor_threads: usize,

    /// Loops driving sessions and health checks.
    pub worker_threads: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            acceptor_threads: 1,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// TCP-connect health check settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Connect timeout in milliseconds.
    pub timeout_ms: u64,

    /// Interval between probes in milliseconds.
    pub period_ms: u64,

    /// Consecutive successes before marking a backend UP.
    pub up: u32,

    /// Consecutive failures before marking a backend DOWN.
    pub down: u32,
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            period_ms: 5000,
            up: 2,
            down: 3,
        }
    }
}

/// A named backend pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerGroupConfig {
    /// Unique group identifier.
    pub alias: String,

    /// Selection algorithm (`wrr` or `wlc`).
    #[serde(default)]
    pub method: Method,

    /// Overrides the top-level health check settings.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// One backend server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique identifier within its group.
    pub alias: String,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Selection weight; 0 keeps the server out of rotation.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    10
}

/// One listening load balancer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpLbConfig {
    /// Unique identifier.
    pub alias: String,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Server group alias to forward to.
    pub backend: String,

    /// Idle connection timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-connection input ring size in bytes.
    #[serde(default = "default_buffer_size")]
    pub in_buffer_size: usize,

    /// Per-connection output ring size in bytes.
    #[serde(default = "default_buffer_size")]
    pub out_buffer_size: usize,

    /// Sticky session idle timeout in milliseconds (0 disables).
    #[serde(default)]
    pub persist_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
