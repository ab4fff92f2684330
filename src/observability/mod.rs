//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! event loops, health checks, proxies, load balancers
//!     → logging.rs (tracing events, fmt subscriber)
//!     → metrics.rs (sessions, rejections, bytes, backend health)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape endpoint (when enabled)
//! ```

pub mod logging;
pub mod metrics;
