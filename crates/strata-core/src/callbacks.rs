//! # Syncer Callbacks
//!
//! The two-method seam every pipeline stage shares.
//!
//! ```text
//! UpdateSource ──▶ Decoupler ──▶ ValidationFilter ──▶ SnapshotCache
//!                      │               │                   │
//!                      └───────────────┴───────────────────┘
//!                         all implement SyncerCallbacks
//!
//! SyncClient ──▶ (agent sink: StateRecorder, calculation graph, ...)
//! ```
//!
//! Because upstream and downstream speak the same interface, stages chain
//! transparently and tests can drive any stage directly.

use std::sync::Arc;

use crate::types::{SyncStatus, Update};

/// Receiver of a datastore update stream.
///
/// Calls arrive from a single caller, in order. Implementations must not
/// block for long: the caller is usually the single writer of a cache.
pub trait SyncerCallbacks: Send + Sync {
    /// Delivers a batch of updates in emission order.
    fn on_updates(&self, updates: Vec<Update>);

    /// Reports a status transition.
    fn on_status_updated(&self, status: SyncStatus);
}

impl<T: SyncerCallbacks + ?Sized> SyncerCallbacks for Arc<T> {
    fn on_updates(&self, updates: Vec<Update>) {
        (**self).on_updates(updates)
    }

    fn on_status_updated(&self, status: SyncStatus) {
        (**self).on_status_updated(status)
    }
}

impl<T: SyncerCallbacks + ?Sized> SyncerCallbacks for Box<T> {
    fn on_updates(&self, updates: Vec<Update>) {
        (**self).on_updates(updates)
    }

    fn on_status_updated(&self, status: SyncStatus) {
        (**self).on_status_updated(status)
    }
}
