//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → LbConfig (validated, immutable)
//!     → lifecycle::startup builds loops, groups and load balancers from it
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; runtime changes go through the
//!   ServerGroup / TcpLb APIs
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    EventLoopConfig, HealthCheckConfig, LbConfig, ObservabilityConfig, ServerConfig,
    ServerGroupConfig, TcpLbConfig,
};
pub use validation::ValidationError;
