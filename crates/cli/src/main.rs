//! Drivenet command line interface
//!
//! Replays blocks of storage notifications against a saved state and prints
//! the resulting state digest, so independent runs can be compared.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use drivenet_observers::{
    BlockContext, ServiceNotification, ServiceNotificationSink, StorageConfig,
    StorageNotification, StorageObservers,
};
use drivenet_storage::{SledStateStore, StorageState};
use drivenet_types::{Height, Key};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "drivenet-cli")]
#[command(about = "Drivenet storage state machine tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply blocks of notifications and print the resulting state digest
    Replay(ReplayCommand),
}

#[derive(Args)]
struct ReplayCommand {
    /// Storage configuration (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Starting state (JSON); ignored when --db holds a snapshot
    #[arg(long, value_name = "PATH")]
    state: Option<PathBuf>,
    /// Blocks to replay (JSON array)
    #[arg(long, value_name = "PATH")]
    notifications: PathBuf,
    /// Sled database to load from and persist into
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Write the final state (JSON) here
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Replicator whose service notifications are reported (hex key)
    #[arg(long, value_name = "HEX")]
    local_replicator: Option<Key>,
}

/// One block worth of notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplayBlock {
    #[serde(flatten)]
    context: BlockContext,
    notifications: Vec<StorageNotification>,
}

#[derive(Debug, Serialize)]
struct ReplaySummary {
    blocks: usize,
    height: Option<Height>,
    receipts: usize,
    state_hash: String,
    service_notifications: Vec<ServiceNotification>,
}

/// Sink that only logs; the summary carries the notifications themselves.
struct LoggingSink;

impl ServiceNotificationSink for LoggingSink {
    fn publish(&self, notification: &ServiceNotification) {
        tracing::debug!(?notification, "Service notification");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Replay(cmd) => {
            let summary = handle_replay(&cmd)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<StorageConfig> {
    let config = match path {
        Some(path) => StorageConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StorageConfig::default(),
    };
    config.validate().context("Invalid storage configuration")?;
    Ok(config)
}

fn load_state(cmd: &ReplayCommand, db: Option<&SledStateStore>) -> Result<StorageState> {
    if let Some(db) = db {
        if let Some(height) = db.latest_height()? {
            info!(height = height.0, "Loading state from database");
            return Ok(db.load()?);
        }
    }
    match &cmd.state {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read state from {}", path.display()))?;
            serde_json::from_str(&content).context("Failed to parse state")
        }
        None => Ok(StorageState::new()),
    }
}

fn load_blocks(path: &Path) -> Result<Vec<ReplayBlock>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read notifications from {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse notifications")
}

fn handle_replay(cmd: &ReplayCommand) -> Result<ReplaySummary> {
    let config = load_config(cmd.config.as_deref())?;
    let db = cmd
        .db
        .as_deref()
        .map(SledStateStore::new)
        .transpose()
        .context("Failed to open state database")?;
    let mut state = load_state(cmd, db.as_ref())?;
    let blocks = load_blocks(&cmd.notifications)?;

    let mut observers = StorageObservers::with_direct_exchange(config);
    if let Some(local) = cmd.local_replicator {
        observers = observers.with_local_replicator(local, Box::new(LoggingSink));
    }

    let mut receipts = 0;
    let mut service_notifications = Vec::new();
    for block in &blocks {
        let outcome = observers
            .notify_all(&mut state, &block.context, &block.notifications)
            .with_context(|| format!("Replay failed at height {}", block.context.height.0))?;
        info!(
            height = block.context.height.0,
            notifications = block.notifications.len(),
            receipts = outcome.receipts.len(),
            "Applied block"
        );
        receipts += outcome.receipts.len();
        service_notifications.extend(outcome.service_notifications);
    }

    let height = blocks.last().map(|block| block.context.height);
    if let (Some(db), Some(height)) = (&db, height) {
        db.save(&state, height)?;
    }
    if let Some(path) = &cmd.output {
        fs::write(path, serde_json::to_vec_pretty(&state)?)
            .with_context(|| format!("Failed to write state to {}", path.display()))?;
    }

    Ok(ReplaySummary {
        blocks: blocks.len(),
        height,
        receipts,
        state_hash: state.state_hash()?.to_hex(),
        service_notifications,
    })
}
