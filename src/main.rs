#![deny(clippy::unwrap_used)]

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use fleetsh::fleet::address::expand;
use fleetsh::fleet::commands::{self, ExecOptions, NodeSpec};
use fleetsh::fleet::config::{
    ConnectSettings, resolve_command_timeout, resolve_inventory_path, resolve_max_concurrency,
};
use fleetsh::fleet::storage::JsonInventory;
use fleetsh::fleet::types::HostDescriptor;

const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Parser)]
#[command(name = "fleetsh")]
#[command(about = "Run commands across groups of hosts over persistent SSH shells.")]
struct Cli {
    /// Inventory file (default: ~/.fleetsh/inventory.json)
    #[arg(long, global = true)]
    inventory: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Dial retries for transient network errors
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Initial retry delay in milliseconds
    #[arg(long, global = true)]
    retry_delay: Option<u64>,

    /// Enable zlib transport compression
    #[arg(long, global = true)]
    compress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage host groups
    #[command(subcommand, alias = "g")]
    Group(GroupCommand),
    /// Manage nodes within a group
    #[command(subcommand, alias = "n")]
    Node(NodeCommand),
    /// Run commands on every node of a group
    #[command(alias = "e")]
    Exec(ExecArgs),
    /// Copy a local file to every reachable node of a group
    Push {
        group: String,
        local: PathBuf,
        remote_dir: String,
        /// Upload timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Create a group and probe its nodes
    Create {
        name: String,
        #[command(flatten)]
        nodes: NodeArgs,
    },
    /// List groups
    #[command(alias = "ls")]
    List,
    /// Show a group and its nodes
    Show { name: String },
    /// Delete a group and its nodes
    #[command(alias = "rm")]
    Delete { name: String },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Add nodes to a group
    Add {
        group: String,
        #[command(flatten)]
        nodes: NodeArgs,
    },
    /// Remove nodes from a group
    #[command(alias = "rm")]
    Remove {
        group: String,
        /// Address range, e.g. 10.0.0.1-20,10.0.1.5
        #[arg(short, long)]
        nodes: String,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// Address range, e.g. 10.0.0.1-20,10.0.1.5
    #[arg(short, long)]
    nodes: String,
    #[arg(short, long, default_value_t = 22)]
    port: u16,
    #[arg(short, long, default_value = "root")]
    user: String,
    #[arg(short, long, default_value = "")]
    description: String,
}

#[derive(Args)]
struct ExecArgs {
    group: String,
    /// Per-command timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Skip these addresses for this run
    #[arg(short, long)]
    exclude: Option<String>,
    /// Extra addresses for this run only (prompts for port, user and password)
    #[arg(short, long)]
    add: Option<String>,
    /// Merge hosts with identical results
    #[arg(short, long)]
    merge: bool,
    /// Write every result under this directory
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Upper bound on hosts worked on at once
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Run this command once and exit instead of starting the console
    #[arg(short, long)]
    command: Option<String>,
}

fn prompt_password() -> Result<String> {
    rpassword::prompt_password("Password: ").context("Failed to read password")
}

fn prompt_default(label: &str, default: &str) -> Result<String> {
    print!("{} [{}]: ", label, default);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim();
    Ok(if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    })
}

fn node_spec(args: NodeArgs) -> Result<NodeSpec> {
    // Reject a bad range before asking for a password.
    expand(&args.nodes)?;
    Ok(NodeSpec {
        nodes: args.nodes,
        port: args.port,
        user: args.user,
        password: prompt_password()?,
        description: args.description,
    })
}

fn extra_hosts(notation: Option<&str>) -> Result<Vec<HostDescriptor>> {
    let Some(notation) = notation else {
        return Ok(Vec::new());
    };
    let addresses = expand(notation)?;

    println!("Credentials for {} added node(s):", addresses.len());
    let port: u16 = prompt_default("Port", "22")?
        .parse()
        .context("Port must be a number between 1 and 65535")?;
    let user = prompt_default("User", "root")?;
    let password = prompt_password()?;

    Ok(addresses
        .into_iter()
        .map(|address| HostDescriptor::new(address, port, &user, &password))
        .collect())
}

/// `RUST_LOG` when set and valid, `warn` otherwise.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Results go to stdout, logs to stderr. RUST_LOG replaces the default.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        ))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = ConnectSettings::resolve(
        cli.connect_timeout,
        cli.retries,
        cli.retry_delay,
        cli.compress.then_some(true),
    );
    let inventory = JsonInventory::open(resolve_inventory_path(cli.inventory))?;
    debug!("Using inventory {}", inventory.path().display());

    match cli.command {
        Command::Group(GroupCommand::Create { name, nodes }) => {
            let description = nodes.description.clone();
            let spec = node_spec(nodes)?;
            commands::group_create(&inventory, &settings, &name, &description, &spec).await
        }
        Command::Group(GroupCommand::List) => commands::group_list(&inventory),
        Command::Group(GroupCommand::Show { name }) => commands::group_show(&inventory, &name),
        Command::Group(GroupCommand::Delete { name }) => commands::group_delete(&inventory, &name),
        Command::Node(NodeCommand::Add { group, nodes }) => {
            let spec = node_spec(nodes)?;
            commands::node_add(&inventory, &settings, &group, &spec).await
        }
        Command::Node(NodeCommand::Remove { group, nodes }) => {
            commands::node_remove(&inventory, &group, &nodes)
        }
        Command::Exec(args) => {
            let options = ExecOptions {
                timeout: resolve_command_timeout(args.timeout),
                extra: extra_hosts(args.add.as_deref())?,
                exclude: args.exclude,
                merge: args.merge,
                save_dir: args.save_dir,
                max_concurrency: resolve_max_concurrency(args.max_concurrency),
                command: args.command,
                group: args.group,
            };
            commands::exec(&inventory, &settings, options).await
        }
        Command::Push {
            group,
            local,
            remote_dir,
            timeout,
        } => {
            let timeout = resolve_command_timeout(timeout);
            commands::push(&inventory, &settings, &group, &local, &remote_dir, timeout).await
        }
    }
}
