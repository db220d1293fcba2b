//! Error types and classification for fleet execution.
//!
//! [`FleetError`] covers the four failure classes of a dispatch:
//!
//! 1. **Connectivity**: dial or authentication failure. The host is excluded
//!    from the run.
//! 2. **Protocol**: pty/shell start failure or a malformed sentinel.
//! 3. **Execution**: non-zero exit status or a command timeout. The remote
//!    shell stays usable.
//! 4. **Aggregation** never errors; malformed addresses fall back to a
//!    singleton bucket.
//!
//! [`is_retryable_error`] decides whether a dial failure is transient. It is
//! only consulted when connection retries are enabled.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the session, pool, dispatch and inventory layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("shell channel error: {0}")]
    Channel(String),

    #[error("command timeout after {timeout:?}")]
    Timeout { timeout: Duration, partial: String },

    /// The sentinel arrived during the grace period after the deadline.
    #[error("command completed with status {code} after timeout of {timeout:?}")]
    LateTimeout {
        timeout: Duration,
        code: i32,
        output: String,
    },

    #[error("command exited with status {code}")]
    ExitStatus { code: i32, output: String },

    #[error("malformed completion marker: {0}")]
    MalformedSentinel(String),

    #[error("invalid variable name '{0}'")]
    InvalidName(String),

    #[error("remote shell is closed")]
    Closed,

    #[error("no hosts to dispatch to")]
    EmptyHostSet,

    #[error("group '{0}' not found")]
    GroupNotFound(String),

    #[error("group '{0}' already exists")]
    GroupExists(String),

    #[error("invalid address notation: {0}")]
    Address(String),

    #[error("inventory error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(String),
}

impl FleetError {
    /// Execution-class errors leave the remote shell usable.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            FleetError::Timeout { .. }
                | FleetError::LateTimeout { .. }
                | FleetError::ExitStatus { .. }
                | FleetError::MalformedSentinel(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FleetError::Timeout { .. } | FleetError::LateTimeout { .. }
        )
    }

    /// Output captured before the failure, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            FleetError::Timeout { partial, .. } => Some(partial),
            FleetError::LateTimeout { output, .. } | FleetError::ExitStatus { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            FleetError::ExitStatus { code, .. } | FleetError::LateTimeout { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        FleetError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Storage(e.to_string())
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "permission denied",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
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

/// Determines if a dial error is retryable (transient) or permanent.
///
/// Authentication failures are checked first and are never retried, so a
/// message like "timeout during authentication failed" is permanent. Unknown
/// errors are retried unless they look like an SSH protocol error without a
/// timeout/connect keyword.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    for auth_err in AUTH_ERRORS {
        if error_lower.contains(auth_err) {
            return false;
        }
    }

    for retryable_err in RETRYABLE_ERRORS {
        if error_lower.contains(retryable_err) {
            return true;
        }
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
