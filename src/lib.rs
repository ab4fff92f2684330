//! Non-blocking TCP load balancer core.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌───────────────────────────────────────────────────────┐
//!                │                        TcpLb                          │
//!   client ─────▶│ acceptor loop: BindServer → Proxy → SecurityPolicy    │
//!                │                  sticky table → ServerGroup::next()   │
//!                │                                     │                 │
//!                │ worker loop:  Connection ⇄ RingBuffer ⇄ Connection ───┼──▶ backend
//!                │                       (Session splice)                │
//!                │                                                       │
//!                │ worker loop:  TcpHealthCheckClient per ServerHandle   │
//!                └───────────────────────────────────────────────────────┘
//! ```

// Runtime foundation
pub mod error;
pub mod event_loop;
pub mod net;

// Traffic management
pub mod health;
pub mod lb;
pub mod load_balancer;
pub mod proxy;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::LbConfig;
pub use error::LbError;
pub use event_loop::{EventLoop, EventLoopGroup};
pub use lb::{TcpLb, TcpLbHolder};
pub use lifecycle::{App, AppContext};
pub use load_balancer::{Method, ServerGroup, ServerHandle};
pub use security::{AllowAll, Protocol, SecurityPolicy};
