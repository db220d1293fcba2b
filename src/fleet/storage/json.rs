//! File-backed inventory.
//!
//! The whole inventory is one JSON document held in memory and rewritten on
//! every change: first to a sibling temp file, then renamed over the original
//! so a crash never leaves a half-written file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::Inventory;
use crate::fleet::error::FleetError;
use crate::fleet::types::{GroupRecord, HostDescriptor, NodeRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryDocument {
    #[serde(default)]
    groups: Vec<GroupRecord>,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

impl InventoryDocument {
    fn has_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g.name == name)
    }

    fn require_group(&self, name: &str) -> Result<(), FleetError> {
        if self.has_group(name) {
            Ok(())
        } else {
            Err(FleetError::GroupNotFound(name.to_string()))
        }
    }
}

/// JSON inventory at a fixed path.
pub struct JsonInventory {
    path: PathBuf,
    document: Mutex<InventoryDocument>,
}

impl JsonInventory {
    /// Load the inventory at `path`, starting empty when the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FleetError> {
        let path = path.into();
        let document = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                InventoryDocument::default()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            InventoryDocument::default()
        };

        debug!(
            "Loaded inventory {} ({} groups, {} nodes)",
            path.display(),
            document.groups.len(),
            document.nodes.len()
        );

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `change` against the document and persist it if it succeeds.
    fn update<T>(
        &self,
        change: impl FnOnce(&mut InventoryDocument) -> Result<T, FleetError>,
    ) -> Result<T, FleetError> {
        let mut document = self
            .document
            .lock()
            .map_err(|_| FleetError::Storage("inventory lock poisoned".to_string()))?;
        let value = change(&mut document)?;
        self.save(&document)?;
        Ok(value)
    }

    fn read<T>(&self, query: impl FnOnce(&InventoryDocument) -> Result<T, FleetError>) -> Result<T, FleetError> {
        let document = self
            .document
            .lock()
            .map_err(|_| FleetError::Storage("inventory lock poisoned".to_string()))?;
        query(&document)
    }

    fn save(&self, document: &InventoryDocument) -> Result<(), FleetError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// Stored passwords are readable by the owner only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), FleetError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), FleetError> {
    Ok(())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn same_node(node: &NodeRecord, address: &str, port: u16, user: &str) -> bool {
    node.address == address && node.port == port && node.user == user
}

impl Inventory for JsonInventory {
    fn create_group(&self, name: &str, description: &str) -> Result<GroupRecord, FleetError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FleetError::Storage("group name cannot be empty".to_string()));
        }

        self.update(|doc| {
            if doc.has_group(name) {
                return Err(FleetError::GroupExists(name.to_string()));
            }
            let group = GroupRecord {
                name: name.to_string(),
                description: description.to_string(),
                created_at: now(),
            };
            doc.groups.push(group.clone());
            Ok(group)
        })
    }

    fn delete_group(&self, name: &str) -> Result<usize, FleetError> {
        self.update(|doc| {
            doc.require_group(name)?;
            doc.groups.retain(|g| g.name != name);
            let before = doc.nodes.len();
            doc.nodes.retain(|n| n.group != name);
            Ok(before - doc.nodes.len())
        })
    }

    fn get_group(&self, name: &str) -> Result<GroupRecord, FleetError> {
        self.read(|doc| {
            doc.groups
                .iter()
                .find(|g| g.name == name)
                .cloned()
                .ok_or_else(|| FleetError::GroupNotFound(name.to_string()))
        })
    }

    fn list_groups(&self) -> Result<Vec<GroupRecord>, FleetError> {
        self.read(|doc| {
            let mut groups = doc.groups.clone();
            groups.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(groups)
        })
    }

    fn add_nodes(&self, group: &str, nodes: Vec<NodeRecord>) -> Result<usize, FleetError> {
        self.update(|doc| {
            doc.require_group(group)?;
            let count = nodes.len();
            for mut node in nodes {
                node.group = group.to_string();
                doc.nodes.retain(|n| {
                    !(n.group == group && same_node(n, &node.address, node.port, &node.user))
                });
                doc.nodes.push(node);
            }
            Ok(count)
        })
    }

    fn remove_nodes(&self, group: &str, addresses: &[String]) -> Result<usize, FleetError> {
        self.update(|doc| {
            doc.require_group(group)?;
            let before = doc.nodes.len();
            doc.nodes
                .retain(|n| !(n.group == group && addresses.contains(&n.address)));
            Ok(before - doc.nodes.len())
        })
    }

    fn list_hosts(&self, group: &str) -> Result<Vec<HostDescriptor>, FleetError> {
        Ok(self
            .list_nodes(group)?
            .iter()
            .filter(|n| n.reachable)
            .map(NodeRecord::descriptor)
            .collect())
    }

    fn list_nodes(&self, group: &str) -> Result<Vec<NodeRecord>, FleetError> {
        self.read(|doc| {
            doc.require_group(group)?;
            Ok(doc
                .nodes
                .iter()
                .filter(|n| n.group == group)
                .cloned()
                .collect())
        })
    }

    fn mark_reachable(&self, host: &HostDescriptor, reachable: bool) -> Result<(), FleetError> {
        let checked_at = now();
        self.update(|doc| {
            for node in doc
                .nodes
                .iter_mut()
                .filter(|n| same_node(n, &host.address, host.port, &host.user))
            {
                node.reachable = reachable;
                node.last_check_at = Some(checked_at.clone());
            }
            Ok(())
        })
    }
}
