//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Interval tick on the backend's assigned loop
//!     → TCP connect with timeout
//!     → up_once / down_once
//!     → state.rs decides whether the backend transitions
//!     → up / down
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Health state is per backend, owned by the backend's check task

pub mod active;
pub mod state;

pub use active::{HealthCheckHandler, TcpHealthCheckClient};
pub use state::{CheckState, HealthState};
