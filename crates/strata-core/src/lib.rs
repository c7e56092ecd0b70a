//! # strata-core: Pure Data Model for the Strata Fan-out Tier
//!
//! This crate holds everything about datastore updates that does not need
//! a socket or a runtime: keys, values, the update stream interface, and the
//! validation stage that sits in front of the snapshot cache.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Strata Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                apps/strata-server (binary)                      │   │
//! │  │     config ──► pipeline ──► server ──► admin endpoint           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    strata-sync                                  │   │
//! │  │     snapcache, server, client, protocol, decoupler              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ strata-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ callbacks │  │validation │  │ recorder  │  │   │
//! │  │   │ Key/Value │  │ Syncer-   │  │ Filter    │  │ State-    │  │   │
//! │  │   │ Update    │  │ Callbacks │  │ normalize │  │ Recorder  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO RUNTIME • PURE TRANSFORMS                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Keys, values, updates, sync status, serialized form
//! - [`callbacks`] - The `SyncerCallbacks` seam shared by every stage
//! - [`validation`] - Validation and per-kind normalization
//! - [`recorder`] - In-memory sink mirroring the received state
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_core::{ResourceKey, StateRecorder, SyncerCallbacks, Update, ValidationFilter};
//!
//! let recorder = Arc::new(StateRecorder::new());
//! let filter = ValidationFilter::new(recorder.clone());
//!
//! filter.on_updates(vec![Update::new(
//!     ResourceKey::global_config("foobar"),
//!     "bazzbiff".into(),
//!     "1234",
//! )]);
//!
//! assert!(recorder.get("/calico/v1/config/foobar").is_some());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod callbacks;
pub mod error;
pub mod recorder;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use callbacks::SyncerCallbacks;
pub use error::{CoreError, CoreResult, ValidationError};
pub use recorder::StateRecorder;
pub use types::*;
pub use validation::ValidationFilter;
