//! TCP forwarding engine.
//!
//! # Data Flow
//! ```text
//! acceptor loop                      worker loop
//! ─────────────                      ───────────
//! accept()
//!   → connector_gen(client)  None → close
//!   → loop_provider()        None → close
//!   → hand socket over ───────────▶ connect(backend)   fail → close client
//!                                   → Session splice (client ⇄ backend)
//!                                   → close → session removed from Proxy
//! ```
//!
//! # Design Decisions
//! - Only `Send` values cross loops (std sockets, connectors, ids)
//! - A proxy-wide stop signal cancels every session wherever it runs

pub mod config;
pub mod server;
pub mod session;

pub use config::{ClientInfo, ConnectorGen, LoopProvider, ProxyNetConfig};
pub use server::{Proxy, ProxyEventHandler};
pub use session::{Session, SessionInfo};
