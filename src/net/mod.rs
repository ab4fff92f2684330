//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! BindServer (socket2, reuse addr/port)
//!     → tokio TcpListener on an acceptor loop
//!     → accepted stream moved to a worker loop
//!     → connection.rs (socket ⇄ ring buffers, edge-driven interest)
//!
//! socket ──read──▶ in RingBuffer ──(session)──▶ peer out RingBuffer ──write──▶ peer socket
//! ```
//!
//! # Design Decisions
//! - Ring buffers are the only backpressure mechanism: a full buffer stops reads
//! - Connections and buffers are loop-local (`Rc`), never shared across threads

pub mod connection;
pub mod listener;
pub mod ring_buffer;

pub use connection::{Connection, ConnectionHandler, ConnectionId, NetFlowRecorder};
pub use listener::BindServer;
pub use ring_buffer::{RingBuffer, RingBufferEtHandler};
