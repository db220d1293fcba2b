//! Fleet command execution over persistent SSH shells.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Host identity, shell state, results and inventory records
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and retry classification
//! - `session`: SSH client handler
//! - `auth`: Authentication strategies
//! - `client`: SSH connection, probe and file push
//! - `sentinel`: Completion marker protocol
//! - `shell`: Persistent remote shell
//! - `pool`: Keyed shell cache
//! - `dispatch`: Concurrent fan-out
//! - `aggregate`: Subnet bucketing and result rendering
//! - `address`: IPv4 range notation
//! - `storage`: Group and node inventory
//! - `console` / `commands`: Operator front end

pub mod address;
pub mod aggregate;
pub(crate) mod auth;
pub(crate) mod client;
pub mod commands;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod sentinel;
pub(crate) mod session;
pub mod shell;
pub mod storage;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use dispatch::Dispatcher;
pub use error::FleetError;
pub use pool::SessionPool;
pub use shell::RemoteShell;
pub use types::{ExecutionResult, HostDescriptor};
