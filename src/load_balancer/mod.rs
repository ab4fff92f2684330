//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! TcpLb connector provider
//!     → pool.rs ServerGroup::next()
//!     → Apply load balancing algorithm over the cached selection state:
//!         - round_robin.rs (precomputed smooth weighted sequence)
//!         - least_conn.rs (weighted least connections scan)
//!     → backend.rs Connector (lazy handle to the chosen ServerHandle)
//! ```
//!
//! # Design Decisions
//! - Selection state is rebuilt on membership/weight/method changes, never per pick
//! - Unhealthy and zero-weight backends are excluded from selection
//! - "No backend" is `None`, never an error

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use backend::{Connector, ServerConnectionGuard, ServerHandle};
pub use least_conn::WeightedLeastConnections;
pub use pool::{ServerGroup, ServerListener};
pub use round_robin::WeightedRoundRobin;

/// A selection algorithm over a fixed snapshot of handles.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    fn next_server(&self) -> Option<Arc<ServerHandle>>;
}

/// Selection algorithm of a server group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Weighted round robin.
    #[default]
    Wrr,
    /// Weighted least connections.
    Wlc,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Wrr => write!(f, "wrr"),
            Method::Wlc => write!(f, "wlc"),
        }
    }
}
