//! # Strata Server
//!
//! Fans one datastore feed out to many agents.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Strata Server                                  │
//! │                                                                         │
//! │  seed file ──► Decoupler ──► ValidationFilter ──► SnapshotCache         │
//! │                                                        │                │
//! │                                                        ▼                │
//! │                                 agents ◄─── SyncServer (5473)           │
//! │                                                                         │
//! │  Admin (9093): /metrics, /readiness                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod admin;
mod seed;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus_client::registry::Registry;
use strata_core::{SyncStatus, SyncerCallbacks, ValidationFilter};
use strata_sync::{SnapshotCache, StrataConfig, SyncServer, SyncerCallbacksDecoupler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::admin::AdminState;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "strata-server", version, about = "Datastore fan-out server")]
struct Args {
    /// Path to strata.toml (defaults to the platform config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON-lines file of key/value pairs loaded as the datastore contents.
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!("Starting Strata server...");

    let config = StrataConfig::load(args.config).context("failed to load configuration")?;
    info!(
        port = config.server.port,
        max_conns = config.server.max_conns,
        admin = config.admin.enabled,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let mut finished = Vec::new();

    // Pipeline: decoupler → validation → cache.
    let cache = Arc::new(SnapshotCache::new(config.cache_config()));
    finished.push(cache.start(cancel.clone()));

    let decoupler = Arc::new(SyncerCallbacksDecoupler::new());
    finished.push(decoupler.spawn_send_to(cancel.clone(), ValidationFilter::new(cache.clone())));

    let server = SyncServer::new(config.server_config(), cache.clone())
        .start(cancel.clone())
        .await
        .context("failed to start sync server")?;
    finished.push(server.finished());
    info!(addr = %server.local_addr(), "Sync server listening");

    if config.admin.enabled {
        let mut registry = Registry::default();
        cache.metrics().register(&mut registry);
        server.metrics().register(&mut registry);
        let state = Arc::new(AdminState {
            registry,
            cache: cache.clone(),
        });
        finished.push(admin::serve(&config.admin, state, cancel.clone()).await?);
    }

    // Feed the datastore contents.
    decoupler.on_status_updated(SyncStatus::ResyncInProgress);
    if let Some(path) = &args.seed {
        let updates = seed::load_seed(path)?;
        info!(path = %path.display(), count = updates.len(), "Loaded seed data");
        decoupler.on_updates(updates);
    }
    decoupler.on_status_updated(SyncStatus::InSync);

    shutdown_signal().await;

    cancel.cancel();
    for done in &finished {
        done.wait().await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
