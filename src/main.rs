//! Sockerless - Docker-compatible container control plane
//!
//! This is the CLI entry point: it serves the backend and manages contexts
//! and pool configuration.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use sockerless::config::{home_dir, ContextConfig, ContextStore, PoolsConfig};
use sockerless::daemon::{DaemonConfig, SockerlessDaemon, DEFAULT_ADDR};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Sockerless - Docker-compatible container control plane
#[derive(Parser)]
#[command(name = "sockerless")]
#[command(version)]
#[command(about = "A Docker-compatible container control plane with pluggable drivers", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the backend API
    Serve {
        /// Listen address
        #[arg(long, default_value = DEFAULT_ADDR)]
        addr: SocketAddr,
        /// Run container commands as host processes
        #[arg(long)]
        sandbox: bool,
        /// Back networks with Linux namespaces (root only)
        #[arg(long)]
        linux_net: bool,
        /// Persist the resource registry to this file
        #[arg(long)]
        registry_file: Option<PathBuf>,
    },

    /// Manage contexts
    Context {
        #[command(subcommand)]
        command: ContextCommands,
    },

    /// Inspect the pools configuration
    Pools {
        #[command(subcommand)]
        command: PoolsCommands,
    },
}

#[derive(Subcommand)]
enum ContextCommands {
    /// Create a context
    Create {
        /// Context name
        name: String,
        /// Backend type
        #[arg(long)]
        backend: String,
        /// Frontend address
        #[arg(long, default_value = "")]
        frontend_addr: String,
        /// Backend address
        #[arg(long, default_value = "")]
        backend_addr: String,
        /// Environment value (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,
    },
    /// List contexts
    #[command(alias = "ls")]
    List,
    /// Make a context active
    Use {
        /// Context name
        name: String,
    },
    /// Show a context's configuration
    Show {
        /// Context name; the active one when omitted
        name: Option<String>,
    },
    /// Delete a context
    #[command(alias = "rm")]
    Delete {
        /// Context name
        name: String,
    },
    /// Print the active context
    Current,
}

#[derive(Subcommand)]
enum PoolsCommands {
    /// Print the effective pools configuration
    Show,
    /// Validate a pools file
    Validate {
        /// File to check; the configured one when omitted
        path: Option<PathBuf>,
    },
}

fn parse_env(entries: &[String]) -> anyhow::Result<HashMap<String, String>> {
    entries
        .iter()
        .map(|e| {
            e.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("invalid env entry {:?}, expected KEY=VALUE", e))
        })
        .collect()
}

async fn serve(
    addr: SocketAddr,
    sandbox: bool,
    linux_net: bool,
    registry_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let contexts = ContextStore::default();
    contexts.load_active_env();

    let config = DaemonConfig::default()
        .with_addr(addr)
        .with_sandbox(sandbox)
        .with_linux_net(linux_net)
        .with_registry_file(registry_file);
    let backend = Arc::new(config.build_backend().with_contexts(contexts));
    SockerlessDaemon::new(config, backend)
        .run()
        .await
        .context("backend server failed")
}

fn run_context(command: ContextCommands) -> anyhow::Result<()> {
    let store = ContextStore::default();
    match command {
        ContextCommands::Create {
            name,
            backend,
            frontend_addr,
            backend_addr,
            env,
        } => {
            let config = ContextConfig {
                backend,
                frontend_addr,
                backend_addr,
                env: parse_env(&env)?,
            };
            store.create(&name, &config)?;
            println!("{}", name);
        }

        ContextCommands::List => {
            let active = store.active_name();
            for name in store.list()? {
                let marker = if name == active { "*" } else { " " };
                println!("{} {}", marker, name);
            }
        }

        ContextCommands::Use { name } => {
            store.set_active(&name)?;
            println!("Switched to context {}", name);
        }

        ContextCommands::Show { name } => {
            let name = name.unwrap_or_else(|| store.active_name());
            if name.is_empty() {
                anyhow::bail!("no active context");
            }
            let config = store.load(&name)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        ContextCommands::Delete { name } => {
            store.delete(&name)?;
            println!("{}", name);
        }

        ContextCommands::Current => {
            let name = store.active_name();
            if !name.is_empty() {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

fn run_pools(command: PoolsCommands) -> anyhow::Result<()> {
    match command {
        PoolsCommands::Show => {
            let pools = PoolsConfig::load(&home_dir())?;
            println!("{}", serde_json::to_string_pretty(&pools)?);
        }

        PoolsCommands::Validate { path } => {
            let path = path.unwrap_or_else(PoolsConfig::source_path);
            let pools = PoolsConfig::from_file(&path)?;
            println!(
                "{}: {} pools ({})",
                path.display(),
                pools.pools.len(),
                pools.pool_names().join(", ")
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            addr,
            sandbox,
            linux_net,
            registry_file,
        } => serve(addr, sandbox, linux_net, registry_file).await,
        Commands::Context { command } => run_context(command),
        Commands::Pools { command } => run_pools(command),
    }
}
