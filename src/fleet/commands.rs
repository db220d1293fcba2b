//! Operations behind the `fleetsh` subcommands.
//!
//! Everything here talks to the operator on stdout; the library layers below
//! only return values.

use std::collections::{BTreeMap, HashSet};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use futures::future::join_all;
use tracing::{info, warn};

use super::address::{compress, expand, sort_key};
use super::aggregate::Renderer;
use super::client;
use super::config::ConnectSettings;
use super::console::{Console, connect_hosts};
use super::dispatch::Dispatcher;
use super::error::FleetError;
use super::pool::SessionPool;
use super::storage::Inventory;
use super::types::{HostDescriptor, NodeRecord};

/// Connection details shared by every node in one `--nodes` range.
#[derive(Clone)]
pub struct NodeSpec {
    pub nodes: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub description: String,
}

impl NodeSpec {
    fn descriptors(&self) -> Result<Vec<HostDescriptor>, FleetError> {
        Ok(expand(&self.nodes)?
            .into_iter()
            .map(|address| HostDescriptor::new(address, self.port, &self.user, &self.password))
            .collect())
    }
}

/// Options for `fleetsh exec`.
pub struct ExecOptions {
    pub group: String,
    pub timeout: Duration,
    pub exclude: Option<String>,
    /// Extra hosts for this run only, never stored
    pub extra: Vec<HostDescriptor>,
    pub merge: bool,
    pub save_dir: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    /// One-shot command; the console starts when absent
    pub command: Option<String>,
}

/// Whether coloured output should be produced.
pub fn use_color() -> bool {
    std::io::stdout().is_terminal()
}

/// Probe every host concurrently and return the ones that failed.
async fn probe_hosts(
    hosts: &[HostDescriptor],
    settings: &ConnectSettings,
) -> Vec<(HostDescriptor, FleetError)> {
    let outcomes = join_all(hosts.iter().map(|host| async move {
        (host.clone(), client::probe(host, settings).await)
    }))
    .await;

    outcomes
        .into_iter()
        .filter_map(|(host, outcome)| outcome.err().map(|e| (host, e)))
        .collect()
}

/// Inventory rows for `hosts`, flagged by whether they answered the probe.
pub fn build_nodes(
    group: &str,
    hosts: &[HostDescriptor],
    description: &str,
    failed: &HashSet<String>,
) -> Vec<NodeRecord> {
    let now = chrono::Utc::now().to_rfc3339();
    hosts
        .iter()
        .map(|host| NodeRecord {
            address: host.address.clone(),
            port: host.port,
            user: host.user.clone(),
            password: host.credential.clone(),
            group: group.to_string(),
            reachable: !failed.contains(&host.address),
            description: description.to_string(),
            added_at: now.clone(),
            last_check_at: Some(now.clone()),
        })
        .collect()
}

/// Failures grouped by error text, one line per distinct error.
pub fn format_failures(failures: &[(HostDescriptor, FleetError)]) -> String {
    let mut by_error: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (host, error) in failures {
        by_error
            .entry(error.to_string())
            .or_default()
            .push(host.address.clone());
    }

    let mut out = String::new();
    for (error, addresses) in by_error {
        let range = compress(&addresses).unwrap_or_else(|_| addresses.join(","));
        out.push_str(&format!("  {}: {}\n", range, error));
    }
    out
}

fn report_failures(failures: &[(HostDescriptor, FleetError)], color: bool) {
    if failures.is_empty() {
        return;
    }
    let header = format!("{} host(s) unreachable:", failures.len());
    if color {
        eprintln!("{}", header.yellow());
    } else {
        eprintln!("{}", header);
    }
    eprint!("{}", format_failures(failures));
}

async fn probe_and_store(
    inventory: &dyn Inventory,
    settings: &ConnectSettings,
    group: &str,
    spec: &NodeSpec,
) -> Result<()> {
    let hosts = spec.descriptors()?;
    println!("Checking {} node(s)...", hosts.len());

    let failures = probe_hosts(&hosts, settings).await;
    let failed: HashSet<String> = failures.iter().map(|(h, _)| h.address.clone()).collect();

    let written = inventory.add_nodes(group, build_nodes(group, &hosts, &spec.description, &failed))?;
    info!("Stored {} node(s) in group {}", written, group);

    report_failures(&failures, use_color());
    println!(
        "{} node(s) stored in '{}', {} reachable",
        written,
        group,
        written - failures.len()
    );
    Ok(())
}

pub async fn group_create(
    inventory: &dyn Inventory,
    settings: &ConnectSettings,
    name: &str,
    description: &str,
    spec: &NodeSpec,
) -> Result<()> {
    // Validate the range before creating anything.
    spec.descriptors()?;
    inventory.create_group(name, description)?;
    probe_and_store(inventory, settings, name, spec).await
}

pub fn group_list(inventory: &dyn Inventory) -> Result<()> {
    let groups = inventory.list_groups()?;
    if groups.is_empty() {
        println!("No groups.");
        return Ok(());
    }

    let mut rows = Vec::with_capacity(groups.len());
    for group in &groups {
        let nodes = inventory.list_nodes(&group.name)?;
        let reachable = nodes.iter().filter(|n| n.reachable).count();
        rows.push((group.name.clone(), nodes.len(), reachable, group.description.clone()));
    }
    print!("{}", format_group_table(&rows));
    Ok(())
}

/// `NAME NODES REACHABLE DESCRIPTION` table.
pub fn format_group_table(rows: &[(String, usize, usize, String)]) -> String {
    let width = rows
        .iter()
        .map(|(name, ..)| name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = format!(
        "{:<width$}  {:>5}  {:>9}  DESCRIPTION\n",
        "NAME", "NODES", "REACHABLE"
    );
    for (name, nodes, reachable, description) in rows {
        out.push_str(&format!(
            "{:<width$}  {:>5}  {:>9}  {}\n",
            name, nodes, reachable, description
        ));
    }
    out
}

pub fn group_show(inventory: &dyn Inventory, name: &str) -> Result<()> {
    let group = inventory.get_group(name)?;
    let nodes = inventory.list_nodes(name)?;

    println!("Group:       {}", group.name);
    if !group.description.is_empty() {
        println!("Description: {}", group.description);
    }
    println!("Created:     {}", group.created_at);
    println!("Nodes:       {}", nodes.len());
    print!("{}", format_node_table(&nodes, use_color()));
    Ok(())
}

/// One line per node, sorted by address.
pub fn format_node_table(nodes: &[NodeRecord], color: bool) -> String {
    let mut nodes: Vec<&NodeRecord> = nodes.iter().collect();
    nodes.sort_by_key(|n| sort_key(&n.address));

    let mut out = String::new();
    for node in nodes {
        let status = if node.reachable { "up" } else { "down" };
        let status = match (color, node.reachable) {
            (false, _) => status.to_string(),
            (true, true) => status.green().to_string(),
            (true, false) => status.red().to_string(),
        };
        out.push_str(&format!(
            "  {:<15} {:>5} {:<10} {:<4} {}\n",
            node.address, node.port, node.user, status, node.description
        ));
    }
    out
}

pub fn group_delete(inventory: &dyn Inventory, name: &str) -> Result<()> {
    let removed = inventory.delete_group(name)?;
    println!("Deleted group '{}' and {} node(s)", name, removed);
    Ok(())
}

pub async fn node_add(
    inventory: &dyn Inventory,
    settings: &ConnectSettings,
    group: &str,
    spec: &NodeSpec,
) -> Result<()> {
    inventory.get_group(group)?;
    probe_and_store(inventory, settings, group, spec).await
}

pub fn node_remove(inventory: &dyn Inventory, group: &str, nodes: &str) -> Result<()> {
    let addresses = expand(nodes)?;
    let removed = inventory.remove_nodes(group, &addresses)?;
    println!("Removed {} node(s) from '{}'", removed, group);
    Ok(())
}

/// Every node of the group minus `exclude`, plus `extra`, one entry per address.
pub fn select_targets(
    nodes: &[NodeRecord],
    exclude: Option<&str>,
    extra: &[HostDescriptor],
) -> Result<Vec<HostDescriptor>, FleetError> {
    let excluded: HashSet<String> = match exclude {
        Some(notation) => expand(notation)?.into_iter().collect(),
        None => HashSet::new(),
    };

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let candidates = nodes
        .iter()
        .map(NodeRecord::descriptor)
        .chain(extra.iter().cloned());
    for host in candidates {
        if excluded.contains(&host.address) {
            continue;
        }
        if seen.insert(host.address.clone()) {
            targets.push(host);
        }
    }
    Ok(targets)
}

pub async fn exec(
    inventory: &dyn Inventory,
    settings: &ConnectSettings,
    options: ExecOptions,
) -> Result<()> {
    inventory.get_group(&options.group)?;
    let nodes = inventory.list_nodes(&options.group)?;
    let targets = select_targets(&nodes, options.exclude.as_deref(), &options.extra)?;
    if targets.is_empty() {
        bail!("group '{}' has no nodes to run on", options.group);
    }

    let color = use_color();
    let pool = Arc::new(SessionPool::ssh(*settings));

    println!("Connecting to {} node(s)...", targets.len());
    let (live, failures) = connect_hosts(&pool, inventory, targets).await;
    report_failures(&failures, color);
    if live.is_empty() {
        pool.close_all().await;
        bail!("no node in '{}' is reachable", options.group);
    }

    let dispatcher = Dispatcher::new(pool.clone()).with_max_concurrency(options.max_concurrency);
    let mut console = Console::new(
        &options.group,
        live,
        dispatcher,
        Renderer::new(options.merge, color),
        options.timeout,
    )
    .with_save_dir(options.save_dir);

    let outcome = match &options.command {
        Some(command) => match console.dispatch(command).await {
            Ok(text) => {
                print!("{}", text);
                Ok(())
            }
            Err(e) => Err(anyhow::Error::from(e)),
        },
        None => console.run().await,
    };

    pool.close_all().await;
    outcome
}

/// `<remote_dir>/<file name of local>`.
pub fn remote_target(local: &Path, remote_dir: &str) -> Result<String> {
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("'{}' has no file name", local.display()))?;
    let dir = remote_dir.trim_end_matches('/');
    Ok(if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    })
}

pub async fn push(
    inventory: &dyn Inventory,
    settings: &ConnectSettings,
    group: &str,
    local: &Path,
    remote_dir: &str,
    timeout: Duration,
) -> Result<()> {
    let content = std::fs::read(local)
        .with_context(|| format!("Failed to read {}", local.display()))?;
    let remote_path = remote_target(local, remote_dir)?;

    inventory.get_group(group)?;
    let hosts = inventory.list_hosts(group)?;
    if hosts.is_empty() {
        bail!("group '{}' has no reachable nodes", group);
    }

    let pool = SessionPool::ssh(*settings);
    let content = &content;
    let remote_path = remote_path.as_str();
    let pool_ref = &pool;

    let mut outcomes = join_all(hosts.iter().map(|host| async move {
        let outcome = match pool_ref.acquire(host).await {
            Ok(shell) => shell.lock().await.push_file(content, remote_path, timeout).await,
            Err(e) => Err(e),
        };
        (host.address.clone(), outcome)
    }))
    .await;
    outcomes.sort_by_key(|(address, _)| sort_key(address));

    pool.close_all().await;

    let color = use_color();
    let mut failed = 0;
    for (address, outcome) in &outcomes {
        match outcome {
            Ok(()) => {
                let tag = if color { "OK".green().to_string() } else { "OK".to_string() };
                println!("[{}] {} {}", address, tag, remote_path);
            }
            Err(e) => {
                failed += 1;
                warn!("Push to {} failed: {}", address, e);
                let tag = if color { "FAIL".red().to_string() } else { "FAIL".to_string() };
                println!("[{}] {} {}", address, tag, e);
            }
        }
    }
    println!("{} ok, {} failed", outcomes.len() - failed, failed);
    Ok(())
}
