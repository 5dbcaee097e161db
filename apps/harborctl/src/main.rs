//! # harborctl
//!
//! Operator CLI for the sync engine: inspect the queue, force a
//! reconciliation pass, and clean up entries that will never sync.
//!
//! ```text
//! harborctl [--config sync.toml] [--memory] <command>
//!
//!   status            connectivity + queue counts
//!   probe             probe the remote store once
//!   drain             replay one batch of the sync queue
//!   pull              copy newer remote rows into SQLite
//!   sync              drain, then pull
//!   failed            list entries past the retry ceiling
//!   cleanup [--days]  drop old synced and exhausted entries
//!   reset --yes       drop every pending entry
//!   watch             run the agent until Ctrl-C
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use harbor_db::DbConfig;
use harbor_sync::{MemoryRemote, SyncAgent, SyncAgentBuilder, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "harborctl")]
#[command(about = "Inspect and drive the Harbor POS sync engine", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-memory database and remote store (dry run)
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show connectivity and queue counts
    Status,
    /// Probe the remote store once
    Probe,
    /// Replay one batch of pending queue entries
    Drain,
    /// Copy newer remote rows into the local store
    Pull,
    /// Drain, then pull
    Sync,
    /// List entries that reached the retry ceiling
    Failed,
    /// Remove old synced entries and every exhausted entry
    Cleanup {
        /// Retention window for synced entries (defaults to config)
        #[arg(long)]
        days: Option<i64>,
    },
    /// Remove every pending entry; their local writes will never sync
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Run the agent until interrupted, logging activity
    Watch,
}

/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=harbor=trace` - Show trace for harbor crates only
/// - Default: INFO level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,harbor=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn build_agent(cli: &Cli) -> Result<SyncAgent> {
    let config = SyncConfig::load(cli.config.clone()).context("loading sync config")?;

    let mut builder = SyncAgentBuilder::new(config);
    if cli.memory {
        builder = builder
            .with_memory_remote(MemoryRemote::new())
            .with_database_config(DbConfig::in_memory());
    }

    builder.build().await.context("starting sync engine")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Command::Reset { yes: false } = cli.command {
        bail!("reset discards unsynced local writes; pass --yes to confirm");
    }

    let mut agent = build_agent(&cli).await?;
    let adapter = agent.adapter().clone();

    // Reconciliation needs a fresh probe; the monitor starts Offline.
    if !matches!(cli.command, Command::Watch) {
        agent.monitor().check_now().await;
    }

    let outcome = match cli.command {
        Command::Status => print_json(&agent.status().await?),
        Command::Probe => {
            let status = agent.monitor().check_now().await;
            println!("remote store: {status}");
            Ok(())
        }
        Command::Drain => print_json(&adapter.drain().await?),
        Command::Pull => print_json(&adapter.pull().await?),
        Command::Sync => print_json(&adapter.sync().await?),
        Command::Failed => print_json(&adapter.list_exhausted().await?),
        Command::Cleanup { days } => print_json(&adapter.cleanup_queue(days).await?),
        Command::Reset { .. } => {
            let removed = adapter.reset_queue().await?;
            println!("removed {removed} pending entries");
            Ok(())
        }
        Command::Watch => watch(&mut agent).await,
    };

    agent.shutdown().await;
    outcome
}

async fn watch(agent: &mut SyncAgent) -> Result<()> {
    let mut activity = agent.events().subscribe_activity();
    let mut changes = agent.events().subscribe_changes();
    agent.start().await?;
    info!("Watching sync activity, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(event) = activity.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(change) = changes.recv() => {
                println!("{}", serde_json::to_string(&change)?);
            }
        }
    }

    Ok(())
}
