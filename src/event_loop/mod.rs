//! Event loop subsystem.
//!
//! # Data Flow
//! ```text
//! control thread
//!     → EventLoop::run_on_loop(job)   (Send closure over a channel)
//!     → loop thread runs job inside its LocalSet
//!     → job spawns local tasks (listeners, connections, health checks, timers)
//!
//! EventLoopGroup::add    → on_event_loop_add() to group attachments
//! EventLoopGroup::remove → EventLoop::close() → on_close() to loop resources
//! ```
//!
//! # Design Decisions
//! - One thread per loop, no work stealing: state owned by a loop is never
//!   touched by another thread
//! - Cross-thread calls only exchange `Send` jobs and atomics

pub mod group;
pub mod wrapper;

pub use group::{EventLoopGroup, EventLoopGroupAttach};
pub use wrapper::{EventLoop, EventLoopAttach, TimerEvent};
