//! agentrmd — the agent resource manager daemon.
//!
//! Opens the snapshot store, rebuilds every stored agent and keeps one
//! processor per agent running until shutdown. The operator subcommands
//! work directly against the store.
//!
//! # Usage
//!
//! ```text
//! agentrmd run --config /etc/agentrm/agentrm.toml
//! agentrmd inspect --data-dir /var/lib/agentrm
//! agentrmd clear agent-1 agent-2
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use agentrm::{AgentManager, AgentSummary};
use agentrm_core::{AgentId, RmConfig};
use agentrm_state::StateStore;

#[derive(Parser)]
#[command(name = "agentrmd", about = "Agent resource manager daemon")]
struct Cli {
    /// Path to agentrm.toml; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding agentrm.redb; overrides `[state] path`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover stored agents and run their processors until interrupted.
    Run,
    /// Print every recovered agent as JSON.
    Inspect,
    /// Delete the stored snapshots of the given agents.
    Clear {
        /// Agent IDs to clear.
        #[arg(required = true)]
        agent_ids: Vec<String>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,agentrm=debug"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &cli.config {
        Some(path) => RmConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RmConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.state.path = data_dir.join("agentrm.redb");
    }

    match cli.command {
        Command::Run => run(config).await,
        Command::Inspect => inspect(&config),
        Command::Clear { agent_ids } => clear(&config, agent_ids),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(path)
        .with_context(|| format!("failed to open state store at {}", path.display()))?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

async fn run(config: RmConfig) -> anyhow::Result<()> {
    info!("agentrm daemon starting");
    let store = open_store(&config.state.path)?;

    let mut manager = AgentManager::new(config, Arc::new(store));
    let mut releases = manager.bus().subscribe();
    let recovered = manager.recover()?;
    info!(agents = recovered, "agents recovered, waiting for reconnects");

    // ── Release log ────────────────────────────────────────────
    // Ends once the manager and every processor have dropped the bus.
    let release_log = tokio::spawn(async move {
        loop {
            match releases.recv().await {
                Ok(release) => info!(
                    allocation_id = %release.allocation_id,
                    reason = %release.reason,
                    force_kill = release.force_kill,
                    "allocation release requested"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "release log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Wait for shutdown ──────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    manager.shutdown().await;
    let _ = release_log.await;

    info!("agentrm daemon stopped");
    Ok(())
}

fn inspect(config: &RmConfig) -> anyhow::Result<()> {
    let store = open_store(&config.state.path)?;
    let mut agents = agentrm::retrieve_agent_states(&store)?;
    agentrm::restore_container_owners(&store, &mut agents)?;

    let mut summaries: Vec<AgentSummary> = agents
        .values()
        .map(|state| state.summary(&format!("/agents/{}", state.id())))
        .collect();
    summaries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn clear(config: &RmConfig, agent_ids: Vec<String>) -> anyhow::Result<()> {
    let store = open_store(&config.state.path)?;
    let ids: Vec<AgentId> = agent_ids.into_iter().map(AgentId::from).collect();
    let removed = agentrm::clear_agent_states(&store, &ids)?;
    println!("cleared {removed} of {} agent(s)", ids.len());
    Ok(())
}
