//! Error types for session and channel lifecycles.
//!
//! Every fallible operation in this crate returns [`Error`]. Scoped operations
//! (`with_session`, `with_channel`, the exec facade) are generic over the
//! caller's error type as long as it implements `From<Error>`, so an error
//! raised by the caller's own operation reaches them untouched.
//!
//! # Retry Classification
//!
//! [`Error::is_retryable`] decides whether a failure is transient. Only
//! [`Error::Connection`] can be retryable, and only when its reason looks like
//! a network problem rather than rejected credentials:
//!
//! 1. **Authentication failures (NOT retryable)**: wrong password, rejected
//!    key, denied access. Retrying only risks locking the account.
//! 2. **Connection errors (retryable)**: refused, reset, timed out, unreachable.
//! 3. **Unknown reasons**: retried unless they look like an SSH protocol error
//!    that does not also mention a timeout or connect failure.
//!
//! Authentication patterns take precedence: "timed out during authentication
//! failed" is not retryable.

use thiserror::Error;

/// Reason patterns that indicate rejected credentials.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "host key",
];

/// Reason patterns that indicate transient network failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

#[derive(Debug, Error)]
pub enum Error {
    /// An override or property could not be resolved into a usable value.
    #[error("invalid configuration: {0}")]
    ConfigResolution(String),

    /// The session could not be connected or authenticated.
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid protocol state: {0}")]
    ProtocolState(String),

    /// A typed channel was requested for a kind with no channel type.
    #[error("unsupported channel type: {0}")]
    UnsupportedChannelType(String),

    /// The server refused to open a channel or rejected a channel request.
    #[error("{kind} channel failed: {reason}")]
    Channel { kind: String, reason: String },

    /// Reading or decoding command output failed.
    #[error("failed to read command output: {0}")]
    Stream(String),

    /// The caller's cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn channel(kind: impl ToString, reason: impl ToString) -> Self {
        Error::Channel {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the operation that produced this error could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { reason, .. } => is_retryable_reason(reason),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Stream(err.to_string())
    }
}

fn is_retryable_reason(reason: &str) -> bool {
    let reason = reason.to_lowercase();

    if AUTH_ERRORS.iter().any(|pattern| reason.contains(pattern)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|pattern| reason.contains(pattern)) {
        return true;
    }

    !reason.contains("ssh") || reason.contains("timeout") || reason.contains("connect")
}
