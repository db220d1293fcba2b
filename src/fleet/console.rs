//! Interactive console over a connected host set.
//!
//! Each line is either a directive (`exit`, `quit`, `nodes`, `merge`, `help`)
//! or a command dispatched to every host. Results are rendered by subnet and,
//! when a save directory is configured, written to disk per dispatch.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::config::Configurer;
use rustyline::error::ReadlineError;
use tracing::{debug, error, warn};

use super::address::compress;
use super::aggregate::{Renderer, bucket_hosts, summary};
use super::config::data_dir;
use super::dispatch::Dispatcher;
use super::error::FleetError;
use super::pool::SessionPool;
use super::storage::Inventory;
use super::types::{ExecutionResult, HostDescriptor};

const HELP: &str = "\
Directives:
  exit, quit   leave the console (Ctrl-D works too)
  nodes        list the hosts commands are sent to
  merge        toggle merging of identical results
  help         show this message
Anything else is run on every host.";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Exit,
    Nodes,
    Merge,
    Help,
    /// Blank line
    Skip,
    Run(String),
}

pub fn parse_directive(line: &str) -> Directive {
    match line.trim() {
        "" => Directive::Skip,
        "exit" | "quit" => Directive::Exit,
        "nodes" => Directive::Nodes,
        "merge" => Directive::Merge,
        "help" => Directive::Help,
        command => Directive::Run(command.to_string()),
    }
}

/// Connect every host, record reachability and return the ones that answered
/// together with the failures.
pub async fn connect_hosts(
    pool: &SessionPool,
    inventory: &dyn Inventory,
    hosts: Vec<HostDescriptor>,
) -> (Vec<HostDescriptor>, Vec<(HostDescriptor, FleetError)>) {
    let failures = pool.warm_up(&hosts).await;
    let failed: HashSet<String> = failures.iter().map(|(h, _)| h.identity_key()).collect();

    let mut live = Vec::with_capacity(hosts.len());
    for host in hosts {
        let reachable = !failed.contains(&host.identity_key());
        if let Err(e) = inventory.mark_reachable(&host, reachable) {
            warn!("Could not record reachability of {}: {}", host.address, e);
        }
        if reachable {
            live.push(host);
        }
    }

    (live, failures)
}

/// Write one dispatch to `<dir>/<group>_<timestamp>/`: `command.txt` plus one
/// `<address>.txt` per host.
pub fn save_results(
    dir: &Path,
    group: &str,
    command: &str,
    results: &HashMap<String, ExecutionResult>,
) -> Result<PathBuf, FleetError> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
    let run_dir = dir.join(format!("{}_{}", group, stamp));
    fs::create_dir_all(&run_dir)?;

    fs::write(run_dir.join("command.txt"), format!("{}\n", command))?;

    for (address, result) in results {
        let mut body = result.output.clone();
        if let Some(error) = &result.error {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&format!("ERROR: {}", error));
        }
        body.push('\n');
        fs::write(run_dir.join(format!("{}.txt", address)), body)?;
    }

    Ok(run_dir)
}

/// Read-dispatch-render loop for one group.
pub struct Console {
    group: String,
    hosts: Vec<HostDescriptor>,
    dispatcher: Dispatcher,
    renderer: Renderer,
    timeout: Duration,
    save_dir: Option<PathBuf>,
}

impl Console {
    pub fn new(
        group: impl Into<String>,
        hosts: Vec<HostDescriptor>,
        dispatcher: Dispatcher,
        renderer: Renderer,
        timeout: Duration,
    ) -> Self {
        Self {
            group: group.into(),
            hosts,
            dispatcher,
            renderer,
            timeout,
            save_dir: None,
        }
    }

    pub fn with_save_dir(mut self, save_dir: Option<PathBuf>) -> Self {
        self.save_dir = save_dir;
        self
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// Flip merge mode, returning the new setting.
    pub fn toggle_merge(&mut self) -> bool {
        self.renderer.merge = !self.renderer.merge;
        self.renderer.merge
    }

    /// `N hosts: <compressed range>`
    pub fn describe_nodes(&self) -> String {
        let addresses: Vec<String> = self.hosts.iter().map(|h| h.address.clone()).collect();
        let range = compress(&addresses).unwrap_or_else(|_| addresses.join(","));
        format!("{} hosts: {}", addresses.len(), range)
    }

    /// Run `command` everywhere and return the rendered block with a summary.
    pub async fn dispatch(&self, command: &str) -> Result<String, FleetError> {
        let results = self.dispatcher.run(&self.hosts, command, self.timeout).await?;

        if let Some(dir) = &self.save_dir {
            match save_results(dir, &self.group, command, &results) {
                Ok(path) => debug!("Saved results to {}", path.display()),
                Err(e) => warn!("Could not save results: {}", e),
            }
        }

        let rendered = self.renderer.render(&bucket_hosts(&self.hosts), &results);
        Ok(format!("{}{}\n", rendered, summary(&results)))
    }

    /// Interactive loop until `exit`, `quit` or Ctrl-D.
    pub async fn run(&mut self) -> Result<()> {
        let history_path = data_dir().join("history");
        let mut rl = DefaultEditor::new()?;
        rl.set_max_history_size(1000)?;
        if history_path.exists() {
            let _ = rl.load_history(&history_path);
        }

        println!(
            "Connected to {} host(s) in '{}'. Type 'help' for directives.",
            self.hosts.len(),
            self.group
        );

        let prompt = format!("fleetsh[{}]> ", self.group);
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let directive = parse_directive(&line);
                    if directive != Directive::Skip {
                        let _ = rl.add_history_entry(line.trim());
                    }

                    match directive {
                        Directive::Exit => break,
                        Directive::Skip => {}
                        Directive::Nodes => println!("{}", self.describe_nodes()),
                        Directive::Help => println!("{}", HELP),
                        Directive::Merge => {
                            let on = self.toggle_merge();
                            println!("merge mode {}", if on { "on" } else { "off" });
                        }
                        Directive::Run(command) => match self.dispatch(&command).await {
                            Ok(text) => print!("{}", text),
                            Err(e) => eprintln!("{}", e),
                        },
                    }
                }
                Err(ReadlineError::Interrupted) => println!("^C"),
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    error!("Console input failed: {}", e);
                    break;
                }
            }
        }

        if let Some(parent) = history_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = rl.save_history(&history_path);
        Ok(())
    }
}
