//! Inventory trait definition.

use crate::fleet::error::FleetError;
use crate::fleet::types::{GroupRecord, HostDescriptor, NodeRecord};

/// Trait for group/node inventory operations.
///
/// Implementations must be thread-safe (`Send + Sync`) so warm-up tasks can
/// write reachability back while other hosts are still connecting.
pub trait Inventory: Send + Sync {
    /// Create an empty group. Fails if the name is taken.
    fn create_group(&self, name: &str, description: &str) -> Result<GroupRecord, FleetError>;

    /// Delete a group and all of its nodes, returning the number of nodes removed.
    fn delete_group(&self, name: &str) -> Result<usize, FleetError>;

    fn get_group(&self, name: &str) -> Result<GroupRecord, FleetError>;

    fn list_groups(&self) -> Result<Vec<GroupRecord>, FleetError>;

    /// Add or replace nodes in `group`. A node with the same address, port
    /// and user is overwritten. Returns the number of nodes written.
    fn add_nodes(&self, group: &str, nodes: Vec<NodeRecord>) -> Result<usize, FleetError>;

    /// Remove nodes by address, returning how many were removed.
    fn remove_nodes(&self, group: &str, addresses: &[String]) -> Result<usize, FleetError>;

    /// Reachable nodes of `group` as dispatch targets.
    fn list_hosts(&self, group: &str) -> Result<Vec<HostDescriptor>, FleetError>;

    /// Every node of `group`, reachable or not.
    fn list_nodes(&self, group: &str) -> Result<Vec<NodeRecord>, FleetError>;

    /// Record the outcome of a connection attempt for every node matching `host`.
    fn mark_reachable(&self, host: &HostDescriptor, reachable: bool) -> Result<(), FleetError>;
}
