//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted client connection:
//!     → access_control.rs (policy.allow(Tcp, client ip, bind port))
//!     → false: connection closed before any backend is chosen
//! ```
//!
//! # Design Decisions
//! - Fail closed: a denied connection never reaches a backend
//! - Policies are plain trait objects; closures qualify

pub mod access_control;

pub use access_control::{AllowAll, Protocol, SecurityPolicy};
