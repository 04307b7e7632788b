//! # Rally — Phased Campaign Daemon
//!
//! Runs the campaign engine: resumes persisted operations, sweeps due phases
//! and messages, serves the HTTP API, and optionally relays ready messages
//! to a webhook.
//!
//! Usage:
//!   rally                          # Start with ~/.rally/config.toml
//!   rally --config ./rally.toml    # Custom config
//!   rally --memory --port 8080     # Ephemeral store, custom port
//!   rally --resume-only            # Reconcile persisted state once and exit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rally_core::config::RallyConfig;
use rally_scheduler::{CampaignEngine, MemoryStore, OperationStore, SqliteStore, WebhookRelay};

#[derive(Parser)]
#[command(
    name = "rally",
    version,
    about = "🚩 Rally — phased campaign orchestration with resumable scheduling"
)]
struct Cli {
    /// Config file (default: ~/.rally/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path (overrides store.path)
    #[arg(long)]
    db_path: Option<String>,

    /// Gateway port (overrides gateway.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Use the in-memory store (nothing survives exit)
    #[arg(long)]
    memory: bool,

    /// Run one resumption pass, print the report, and exit
    #[arg(long)]
    resume_only: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<RallyConfig> {
    let mut config = match &cli.config {
        Some(path) => RallyConfig::load_from(&expand_path(path))?,
        None => RallyConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.store.path = db_path.clone();
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if cli.memory {
        config.store.backend = "memory".into();
    }
    Ok(config)
}

fn open_store(config: &RallyConfig) -> Result<Arc<dyn OperationStore>> {
    match config.store.backend.as_str() {
        "memory" => {
            tracing::warn!("⚠️  In-memory store: operations will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        "sqlite" => {
            let path = config.store.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::info!("💾 Store: {}", path.display());
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        other => anyhow::bail!("unknown store backend '{other}' (expected sqlite or memory)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "rally=debug,rally_core=debug,rally_scheduler=debug,rally_gateway=debug,tower_http=debug"
    } else {
        "rally=info,rally_core=info,rally_scheduler=info,rally_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    let store = open_store(&config)?;
    let engine = Arc::new(CampaignEngine::new(store, config.clone()));

    let report = engine.resume();
    if cli.resume_only {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(rally_scheduler::spawn_sweeper(
        engine.clone(),
        Duration::from_millis(config.engine.sweep_interval_ms.max(1)),
        shutdown_rx.clone(),
    )));

    if let Some(relay) = WebhookRelay::from_config(&config.relay) {
        tasks.push(tokio::spawn(rally_scheduler::spawn_relay(
            engine.clone(),
            relay,
            Duration::from_secs(config.relay.poll_interval_secs.max(1)),
            shutdown_rx.clone(),
        )));
    }

    if config.gateway.enabled {
        let gateway_config = config.gateway.clone();
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = rally_gateway::start(&gateway_config, engine, rx).await {
                tracing::error!("❌ Gateway failed: {e}");
            }
        }));
    }

    tracing::info!(
        "🚩 Rally running ({} phases, sweep every {}ms). Ctrl-C to stop.",
        config.engine.max_phase,
        config.engine.sweep_interval_ms
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutting down...");
    shutdown_tx.send(true)?;
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
