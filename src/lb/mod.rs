//! Load balancer facade.
//!
//! # Data Flow
//! ```text
//! TcpLb::start()
//!     → BindServer per acceptor loop → Proxy::handle()
//!
//! accepted client (acceptor loop)
//!     → SecurityPolicy::allow()      deny → close
//!     → sticky table (persist.rs)    valid entry → reuse backend
//!     → ServerGroup::next()          None → close
//!     → Connector handed to the Proxy
//! ```

pub mod holder;
pub mod persist;
pub mod tcp_lb;

pub use holder::TcpLbHolder;
pub use persist::Persist;
pub use tcp_lb::TcpLb;
