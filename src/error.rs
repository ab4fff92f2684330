//! Error taxonomy shared by every component.
//!
//! "No backend available" is not an error: selection returns `None` and the
//! proxy treats it as a normal rejection of that one connection.

use thiserror::Error;

/// Errors raised by control operations on loops, groups and load balancers.
#[derive(Debug, Error)]
pub enum LbError {
    /// A resource with the same identity is already registered.
    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The referenced resource does not exist.
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    /// The target was closed or destroyed and accepts no more operations.
    #[error("{0} is closed")]
    Closed(String),

    /// Socket level failure (bind, connect, runtime setup).
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Buffers can only be switched while both of them are empty.
    #[error("cannot switch buffers while they still hold data")]
    RejectSwitch,
}

impl LbError {
    pub(crate) fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        LbError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        LbError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn closed(what: impl Into<String>) -> Self {
        LbError::Closed(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_resource() {
        let err = LbError::already_exists("server", "web-1");
        assert_eq!(err.to_string(), "server `web-1` already exists");

        let err = LbError::not_found("event loop", "worker-3");
        assert_eq!(err.to_string(), "event loop `worker-3` not found");

        let err = LbError::closed("tcp-lb `edge`");
        assert_eq!(err.to_string(), "tcp-lb `edge` is closed");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken");
        let err: LbError = io.into();
        assert!(matches!(err, LbError::Io(_)));
    }
}
