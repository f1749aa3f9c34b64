//! # Error Model
//!
//! Purpose: One error type shared by the decode path, the command handles
//! and the networked client, so a failure keeps its kind from the socket up
//! to the caller.
//!
//! ## Design Principles
//! 1. **Kinds, Not Strings**: Each variant maps to one recovery policy
//!    (fatal, retry the wait, reconnect, fail fast).
//! 2. **Inspectable Causes**: `Connection` keeps the transport failure so
//!    `source()` chains reach the original `std::io::Error`.
//! 3. **Cheap Clones**: Results are read by many waiters, so errors clone
//!    by sharing their cause.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Result type used across the workspace.
pub type HkvResult<T> = Result<T, HkvError>;

/// Shared, type-erased cause of a failure.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Error reply sent by the server, e.g. `-ERR unknown command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    message: String,
}

impl ServerError {
    /// Builds a server error from the raw reply payload.
    pub fn new(message: &[u8]) -> Self {
        ServerError {
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }

    /// Human-readable message as sent by the server.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ServerError {}

/// Errors surfaced by the client.
#[derive(Debug, Clone)]
pub enum HkvError {
    /// Malformed reply framing; the connection that produced it is closed.
    Protocol(String),
    /// A result sink was fed a representation it does not accept.
    /// Indicates a programming error and is never retried.
    LocalUsage(String),
    /// Transport failure, with the underlying cause when one exists.
    Connection {
        message: String,
        cause: Option<Cause>,
    },
    /// A bounded wait elapsed before the operation completed.
    Timeout,
    /// The waiting thread was interrupted while waiting.
    Interrupted,
    /// The operation was cancelled and never produced a value.
    Cancelled,
    /// No node is currently known for the role the operation needs.
    TopologyUnavailable(String),
    /// The server answered with an error reply.
    Server(ServerError),
    /// Invalid client configuration.
    Config(String),
}

impl HkvError {
    /// Connection error without a transport cause.
    pub fn connection(message: impl Into<String>) -> Self {
        HkvError::Connection {
            message: message.into(),
            cause: None,
        }
    }

    /// Connection error wrapping the failure that caused it.
    pub fn connection_caused_by<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        HkvError::Connection {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Returns true for errors the caller may recover from by waiting again
    /// or retrying on a fresh connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HkvError::Timeout | HkvError::Connection { .. } | HkvError::TopologyUnavailable(_)
        )
    }
}

impl fmt::Display for HkvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HkvError::Protocol(detail) => write!(f, "protocol error: {}", detail),
            HkvError::LocalUsage(detail) => write!(f, "illegal output usage: {}", detail),
            HkvError::Connection { message, .. } => write!(f, "connection error: {}", message),
            HkvError::Timeout => write!(f, "command timed out"),
            HkvError::Interrupted => write!(f, "interrupted while waiting for command"),
            HkvError::Cancelled => write!(f, "command was cancelled"),
            HkvError::TopologyUnavailable(detail) => write!(f, "topology unavailable: {}", detail),
            HkvError::Server(err) => write!(f, "server error: {}", err),
            HkvError::Config(detail) => write!(f, "invalid configuration: {}", detail),
        }
    }
}

impl StdError for HkvError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            HkvError::Connection {
                cause: Some(cause), ..
            } => Some(cause.as_ref()),
            HkvError::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HkvError {
    fn from(err: std::io::Error) -> Self {
        HkvError::connection_caused_by("i/o failure", err)
    }
}

impl From<ServerError> for HkvError {
    fn from(err: ServerError) -> Self {
        HkvError::Server(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_cause_is_downcastable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let inner = HkvError::connection_caused_by("unable to connect to 127.0.0.1:1", io);
        let outer = HkvError::connection_caused_by("all sentinels unreachable", inner);

        let first = outer.source().expect("first cause");
        assert!(first.downcast_ref::<HkvError>().is_some());
        let second = first.source().expect("second cause");
        let io = second.downcast_ref::<std::io::Error>().expect("io cause");
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn server_error_keeps_message() {
        let err = HkvError::from(ServerError::new(b"ERR wrong type"));
        assert_eq!(err.to_string(), "server error: ERR wrong type");
    }
}
