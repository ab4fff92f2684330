//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Event loops → Server groups → Load balancers → Bind
//!
//! Shutdown (shutdown.rs):
//!     Ctrl-C → AppContext::teardown() → destroy LBs → destroy groups → close loops
//! ```

pub mod shutdown;
pub mod startup;

pub use shutdown::{AppContext, Shutdown};
pub use startup::{App, StartupError};
