//! sync-worker: runs the changeset sync registry against a fixture store.
//!
//! Loads code hosts and changesets from a JSON fixture into a
//! `MemorySyncStore`, starts one scheduler per supported host and keeps
//! syncing until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use hostsync_core::{load_dotenv, ChangesetId, SyncerConfig};
use hostsync_syncer::{EchoSource, MemorySyncStore, SourcedSyncer, SyncRegistry};

// ── CLI ─────────────────────────────────────────────────────────────

/// Changeset sync worker.
#[derive(Parser, Debug)]
#[command(name = "sync-worker", version, about)]
struct Cli {
    /// Path to a TOML syncer config. Defaults plus HOSTSYNC_* env vars when omitted.
    #[arg(long, env = "HOSTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// JSON fixture with code hosts and changesets.
    #[arg(long, env = "HOSTSYNC_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Changeset ids to sync immediately after startup.
    #[arg(long, value_delimiter = ',')]
    urgent: Vec<ChangesetId>,

    /// Metrics report interval in seconds.
    #[arg(long, env = "HOSTSYNC_REPORT_INTERVAL", default_value_t = 60)]
    report_interval: u64,

    /// Shutdown timeout in seconds.
    #[arg(long, env = "HOSTSYNC_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let config = SyncerConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            info!(path = %path.display(), "loaded syncer config");
            config
        }
        None => SyncerConfig::from_env().context("reading config from environment")?,
    };
    config.log_summary();

    let store = match &cli.fixture {
        Some(path) => {
            let store = MemorySyncStore::from_file(path)
                .with_context(|| format!("loading fixture {}", path.display()))?;
            info!(path = %path.display(), "loaded fixture");
            store
        }
        None => {
            warn!("no fixture given, starting with an empty store");
            MemorySyncStore::new()
        }
    };
    let store = Arc::new(store);

    let syncer = Arc::new(SourcedSyncer::new(store.clone(), Arc::new(EchoSource)));
    let registry = SyncRegistry::new(store, syncer, config);
    registry.start().await;
    info!(hosts = ?registry.host_keys(), "sync worker running, press Ctrl-C to stop");

    if !cli.urgent.is_empty() {
        registry
            .enqueue_urgent_sync(cli.urgent.clone())
            .context("enqueueing urgent syncs")?;
        info!(ids = ?cli.urgent, "urgent syncs enqueued");
    }

    let report_every = Duration::from_secs(cli.report_interval.max(1));
    let mut report = tokio::time::interval(report_every);
    report.tick().await; // skip immediate tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C, shutting down...");
                break;
            }
            _ = report.tick() => {
                match serde_json::to_string(&registry.metrics()) {
                    Ok(snapshot) => info!(metrics = %snapshot, "syncer metrics"),
                    Err(e) => warn!(error = %e, "failed to serialize metrics"),
                }
            }
        }
    }

    registry.stop();
    let shutdown = Duration::from_secs(cli.shutdown_timeout);
    if tokio::time::timeout(shutdown, registry.join()).await.is_err() {
        warn!(timeout = ?shutdown, "sync tasks did not stop in time");
    }

    info!("sync worker stopped");
    Ok(())
}
