//! Error types for the external module client

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type YateResult<T> = Result<T, YateError>;

/// Errors surfaced by the external module client.
///
/// Timeouts and negative engine replies normally resolve quietly through
/// per-operation sentinels (`false`, `None`, or the original message) and do
/// not appear here; see the crate documentation for the propagation policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum YateError {
    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link is down and reconnection is disabled.
    #[error("not connected to engine")]
    NotConnected,

    /// The engine closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The offline queue reached its bound; the line was not accepted.
    #[error("offline queue full, line dropped")]
    QueueFull,

    /// A correlated request did not complete within its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A channel operation was cancelled by a `reset`.
    #[error("operation cancelled by channel reset")]
    Cancelled,

    /// Invalid operation input; rejected locally, never reaches the wire.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the input.
        message: String,
    },

    /// A malformed or unexpected line was received from the engine.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// Description of the violation.
        message: String,
    },
}

impl YateError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        YateError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        YateError::ProtocolError {
            message: message.into(),
        }
    }
}
