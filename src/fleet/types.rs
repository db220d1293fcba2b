//! Core data types shared by the session, dispatch and rendering layers.
//!
//! - [`HostDescriptor`]: immutable identity of one remote target
//! - [`ShellState`]: lifecycle of a [`RemoteShell`](super::shell::RemoteShell)
//! - [`ExecutionResult`]: the outcome of one command on one host
//! - [`GroupRecord`] / [`NodeRecord`]: rows persisted by the inventory

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::FleetError;

/// Identity and credential for one remote target.
///
/// Equality and hashing use `(address, port, user)` only, so two descriptors
/// that differ in password or label still map to the same pooled shell.
#[derive(Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub address: String,
    pub port: u16,
    pub user: String,
    /// Password used for authentication
    #[serde(default)]
    pub credential: String,
    /// Free-text label shown next to the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_label: Option<String>,
}

impl HostDescriptor {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            user: user.into(),
            credential: credential.into(),
            display_label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.display_label = Some(label.into());
        self
    }

    /// Pool identity key: `address:port:user`.
    pub fn identity_key(&self) -> String {
        format!("{}:{}:{}", self.address, self.port, self.user)
    }

    /// Label for console output, `address (label)` when a label is set.
    pub fn label(&self) -> String {
        match &self.display_label {
            Some(label) if !label.is_empty() => format!("{} ({})", self.address, label),
            _ => self.address.clone(),
        }
    }
}

impl PartialEq for HostDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port && self.user == other.user
    }
}

impl Eq for HostDescriptor {}

impl Hash for HostDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
        self.user.hash(state);
    }
}

// Never print the credential.
impl fmt::Debug for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDescriptor")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("display_label", &self.display_label)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a remote shell.
///
/// `Disconnected -> Connected -> ShellReady -> Idle <-> Executing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellState {
    Disconnected,
    Connected,
    ShellReady,
    Idle,
    Executing,
    Closed,
}

impl fmt::Display for ShellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShellState::Disconnected => "disconnected",
            ShellState::Connected => "connected",
            ShellState::ShellReady => "shell_ready",
            ShellState::Idle => "idle",
            ShellState::Executing => "executing",
            ShellState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one dispatched command on one host.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub host: String,
    /// Combined stdout/stderr, trimmed (partial output on timeout)
    pub output: String,
    pub error: Option<FleetError>,
    pub success: bool,
    /// Exit status reported through the sentinel, if one was seen
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn ok(host: impl Into<String>, output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            host: host.into(),
            output: output.into(),
            error: None,
            success: true,
            exit_code: Some(0),
            elapsed,
        }
    }

    /// Build a failed result, lifting partial output and exit code out of the error.
    pub fn failed(host: impl Into<String>, error: FleetError, elapsed: Duration) -> Self {
        let output = error.partial_output().unwrap_or_default().to_string();
        let exit_code = error.exit_code();
        Self {
            host: host.into(),
            output,
            error: Some(error),
            success: false,
            exit_code,
            elapsed,
        }
    }

    /// Error text, empty for successes.
    pub fn error_text(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }
}

/// A named group of nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// RFC3339 creation timestamp
    pub created_at: String,
}

/// One node row in the inventory.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub group: String,
    #[serde(default)]
    pub reachable: bool,
    #[serde(default)]
    pub description: String,
    pub added_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<String>,
}

impl NodeRecord {
    pub fn descriptor(&self) -> HostDescriptor {
        let host = HostDescriptor::new(&self.address, self.port, &self.user, &self.password);
        if self.description.is_empty() {
            host
        } else {
            host.with_label(&self.description)
        }
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("group", &self.group)
            .field("reachable", &self.reachable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    mod host_descriptor {
        use super::*;

        #[test]
        fn test_identity_key_format() {
            let host = HostDescriptor::new("10.0.0.1", 22, "root", "secret");
            assert_eq!(host.identity_key(), "10.0.0.1:22:root");
        }

        #[test]
        fn test_equality_ignores_credential_and_label() {
            let a = HostDescriptor::new("10.0.0.1", 22, "root", "one");
            let b = HostDescriptor::new("10.0.0.1", 22, "root", "two").with_label("db");
            assert_eq!(a, b);

            let mut set = HashSet::new();
            set.insert(a);
            assert!(!set.insert(b));
        }

        #[test]
        fn test_port_and_user_distinguish_hosts() {
            let a = HostDescriptor::new("10.0.0.1", 22, "root", "");
            assert_ne!(a, HostDescriptor::new("10.0.0.1", 2222, "root", ""));
            assert_ne!(a, HostDescriptor::new("10.0.0.1", 22, "admin", ""));
        }

        #[test]
        fn test_label() {
            let host = HostDescriptor::new("10.0.0.1", 22, "root", "");
            assert_eq!(host.label(), "10.0.0.1");
            assert_eq!(host.with_label("web").label(), "10.0.0.1 (web)");
        }

        #[test]
        fn test_debug_hides_credential() {
            let host = HostDescriptor::new("10.0.0.1", 22, "root", "hunter2");
            assert!(!format!("{:?}", host).contains("hunter2"));
        }
    }

    mod execution_result {
        use super::*;

        #[test]
        fn test_failed_lifts_exit_code_and_output() {
            let err = FleetError::ExitStatus {
                code: 17,
                output: "boom".to_string(),
            };
            let result = ExecutionResult::failed("10.0.0.1", err, Duration::ZERO);
            assert!(!result.success);
            assert_eq!(result.exit_code, Some(17));
            assert_eq!(result.output, "boom");
            assert!(result.error_text().contains("17"));
        }

        #[test]
        fn test_failed_connect_has_no_output() {
            let err = FleetError::Connect("connection refused".to_string());
            let result = ExecutionResult::failed("10.0.0.1", err, Duration::ZERO);
            assert_eq!(result.output, "");
            assert_eq!(result.exit_code, None);
        }

        #[test]
        fn test_ok() {
            let result = ExecutionResult::ok("10.0.0.1", "hi", Duration::ZERO);
            assert!(result.success);
            assert_eq!(result.exit_code, Some(0));
            assert_eq!(result.error_text(), "");
        }
    }

    mod shell_state {
        use super::*;

        #[test]
        fn test_display() {
            assert_eq!(ShellState::ShellReady.to_string(), "shell_ready");
            assert_eq!(ShellState::Closed.to_string(), "closed");
        }

        #[test]
        fn test_serialize_snake_case() {
            let json = serde_json::to_string(&ShellState::ShellReady).unwrap();
            assert_eq!(json, "\"shell_ready\"");
        }
    }
}
