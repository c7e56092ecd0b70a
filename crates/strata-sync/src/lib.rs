//! # strata-sync: Snapshot Cache and Fan-out Transport
//!
//! This crate turns one datastore update stream into many client streams:
//! a single-writer snapshot cache, a TCP server that streams it to every
//! connected client, and the reconnecting client that consumes it.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Strata Fan-out Pipeline                          │
//! │                                                                         │
//! │  datastore ──▶ Decoupler ──▶ ValidationFilter ──▶ SnapshotCache         │
//! │  watcher       (own task)    (strata-core)        (breadcrumbs)         │
//! │                                                        │                │
//! │                                                        ▼                │
//! │                                              ┌──────────────────┐       │
//! │                                              │    SyncServer    │       │
//! │                                              │  accept + drop   │       │
//! │                                              │  one task/conn   │       │
//! │                                              └────────┬─────────┘       │
//! │                       length-prefixed JSON frames     │                 │
//! │                 ┌─────────────────┬───────────────────┤                 │
//! │                 ▼                 ▼                   ▼                 │
//! │           ┌──────────┐      ┌──────────┐        ┌──────────┐            │
//! │           │SyncClient│      │SyncClient│  ...   │SyncClient│            │
//! │           │ ▶ sink   │      │ ▶ sink   │        │ ▶ sink   │            │
//! │           └──────────┘      └──────────┘        └──────────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`snapcache`] - Breadcrumb chain and the single-writer cache
//! - [`server`] - Connection manager, heartbeats, admission control
//! - [`client`] - Reconnecting client session
//! - [`protocol`] - Envelope types and the framed codec
//! - [`decoupler`] - Moves callbacks onto their own task
//! - [`config`] - TOML/env configuration
//! - [`metrics`] - Prometheus metrics per cache and server
//! - [`lifecycle`] - `Finished` completion signal
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_core::StateRecorder;
//! use strata_sync::{CacheConfig, ClientConfig, ServerConfig, SnapshotCache, SyncClient, SyncServer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> strata_sync::SyncResult<()> {
//! let cancel = CancellationToken::new();
//! let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
//! let _cache_done = cache.start(cancel.clone());
//!
//! let server = SyncServer::new(ServerConfig::default().with_port(0), cache.clone())
//!     .start(cancel.clone())
//!     .await?;
//!
//! let recorder = Arc::new(StateRecorder::new());
//! let client = SyncClient::new(
//!     ClientConfig::new(format!("127.0.0.1:{}", server.port())),
//!     recorder.clone(),
//! )
//! .start(cancel.clone());
//!
//! cancel.cancel();
//! server.finished().wait().await;
//! client.finished().wait().await;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod config;
pub mod decoupler;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod snapcache;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{ClientConfig, ClientHandle, ConnectionState, SyncClient};
pub use config::{AdminSettings, CacheSettings, ClientSettings, ServerSettings, StrataConfig};
pub use decoupler::SyncerCallbacksDecoupler;
pub use error::{SyncError, SyncResult};
pub use lifecycle::Finished;
pub use metrics::{CacheMetrics, ServerMetrics};
pub use protocol::{Envelope, KvsPhase, PROTOCOL_VERSION};
pub use server::{ConnectionInfo, DisconnectReason, ServerConfig, ServerHandle, SyncServer};
pub use snapcache::{Breadcrumb, CacheConfig, SnapshotCache};
