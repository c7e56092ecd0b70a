//! # Snapshot Cache
//!
//! Turns the single-writer update stream into a chain of immutable
//! [`Breadcrumb`]s that any number of readers can follow at their own pace.
//!
//! ## Breadcrumb Chain
//! ```text
//!  writer ──on_updates()──▶ pending batch ──publish──┐
//!                            (working kvs)           │
//!                                                    ▼
//!  ┌──────────┐ next  ┌──────────┐ next  ┌──────────┐ next
//!  │ seq 0    │──────▶│ seq 1    │──────▶│ seq 2    │──────▶ (empty slot)
//!  │ kvs: {}  │       │ kvs: v1  │       │ kvs: v2  │            ▲
//!  └──────────┘       └──────────┘       └──────────┘            │
//!       ▲                  ▲                   ▲          readers wait here
//!   slow reader        reader B            current
//! ```
//!
//! Each breadcrumb holds the full snapshot as an `im::OrdMap`, so publishing
//! shares structure with the previous version and readers never copy.
//!
//! ## Publication Triggers
//! - the pending batch reaches `max_batch_size`
//! - the wake-up task ticks and the batch is not empty
//! - the sync status changes (flushes even an empty batch)
//!
//! The writer never waits on readers. A reader that falls behind keeps its
//! old breadcrumbs (and everything after them) alive until it catches up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use strata_core::{SerializedUpdate, SyncStatus, SyncerCallbacks, Update};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::Finished;
use crate::metrics::CacheMetrics;

// =============================================================================
// Configuration
// =============================================================================

/// Runtime settings of a [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Pending updates that force a publication.
    pub max_batch_size: usize,
    /// Period of the wake-up task that flushes partial batches.
    pub wake_up_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            wake_up_interval: Duration::from_millis(100),
        }
    }
}

impl CacheConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_wake_up_interval(mut self, wake_up_interval: Duration) -> Self {
        self.wake_up_interval = wake_up_interval;
        self
    }
}

// =============================================================================
// Breadcrumb
// =============================================================================

/// An immutable published version of the snapshot.
#[derive(Debug)]
pub struct Breadcrumb {
    /// Publication sequence; the initial breadcrumb is 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub status: SyncStatus,
    /// Net changes since the previous breadcrumb, in first-seen order.
    pub updates: Vec<SerializedUpdate>,
    /// Full snapshot keyed by default path.
    pub kvs: OrdMap<String, SerializedUpdate>,
    /// Filled exactly once, when the following breadcrumb is published.
    next: watch::Sender<Option<Arc<Breadcrumb>>>,
}

impl Breadcrumb {
    fn new(
        seq: u64,
        status: SyncStatus,
        updates: Vec<SerializedUpdate>,
        kvs: OrdMap<String, SerializedUpdate>,
    ) -> Self {
        let (next, _) = watch::channel(None);
        Self {
            seq,
            timestamp: Utc::now(),
            status,
            updates,
            kvs,
            next,
        }
    }

    /// Waits for the breadcrumb published after this one.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Arc<Breadcrumb>> {
        let mut rx = self.next.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => None,
            slot = rx.wait_for(Option::is_some) => slot.ok().and_then(|next| next.clone()),
        }
    }

    /// Like [`Breadcrumb::next`], but also gives up after `dur`.
    pub async fn next_timeout(
        &self,
        dur: Duration,
        cancel: &CancellationToken,
    ) -> Option<Arc<Breadcrumb>> {
        tokio::time::timeout(dur, self.next(cancel)).await.ok().flatten()
    }

    /// Returns the following breadcrumb if it has already been published.
    pub fn try_next(&self) -> Option<Arc<Breadcrumb>> {
        self.next.borrow().clone()
    }

    fn link(&self, next: Arc<Breadcrumb>) {
        self.next.send_replace(Some(next));
    }
}

impl Drop for Breadcrumb {
    // Unlinks the chain iteratively; recursive drops of a long unread chain
    // would overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.send_replace(None);
        while let Some(crumb) = next {
            match Arc::try_unwrap(crumb) {
                Ok(owned) => next = owned.next.send_replace(None),
                Err(_) => break,
            }
        }
    }
}

// =============================================================================
// Snapshot Cache
// =============================================================================

struct PendingState {
    /// Snapshot including unpublished changes.
    kvs: OrdMap<String, SerializedUpdate>,
    /// Snapshot of the last published breadcrumb.
    published: OrdMap<String, SerializedUpdate>,
    /// Slots are emptied when a change cancels out within the batch.
    batch: Vec<Option<SerializedUpdate>>,
    batch_index: HashMap<String, usize>,
    batch_len: usize,
    status: SyncStatus,
    seq: u64,
}

/// Single-writer, many-reader cache of the datastore contents.
pub struct SnapshotCache {
    config: CacheConfig,
    current: RwLock<Arc<Breadcrumb>>,
    pending: Mutex<PendingState>,
    writing: AtomicBool,
    metrics: CacheMetrics,
}

/// Clears the in-writer flag on every exit path.
struct WriterGuard<'a>(&'a AtomicBool);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        let initial = Arc::new(Breadcrumb::new(
            0,
            SyncStatus::WaitingForDatastore,
            Vec::new(),
            OrdMap::new(),
        ));

        Self {
            config,
            current: RwLock::new(initial),
            pending: Mutex::new(PendingState {
                kvs: OrdMap::new(),
                published: OrdMap::new(),
                batch: Vec::new(),
                batch_index: HashMap::new(),
                batch_len: 0,
                status: SyncStatus::WaitingForDatastore,
                seq: 0,
            }),
            writing: AtomicBool::new(false),
            metrics: CacheMetrics::default(),
        }
    }

    /// Returns the most recently published breadcrumb.
    pub fn current_breadcrumb(&self) -> Arc<Breadcrumb> {
        self.current.read().clone()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Spawns the wake-up task that flushes partial batches.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Finished {
        let (finished, guard) = Finished::new();
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval(cache.config.wake_up_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Snapshot cache wake-up task stopping");
                        break;
                    }
                    _ = ticker.tick() => cache.flush_pending(),
                }
            }
        });

        finished
    }

    fn enter_writer(&self) -> WriterGuard<'_> {
        if self.writing.swap(true, Ordering::AcqRel) {
            panic!("SnapshotCache: concurrent writers detected");
        }
        WriterGuard(&self.writing)
    }

    fn flush_pending(&self) {
        let mut pending = self.pending.lock();
        if pending.batch_len > 0 {
            self.publish_locked(&mut pending);
        }
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    fn apply(&self, pending: &mut PendingState, update: SerializedUpdate) {
        let key = update.key.clone();

        if update.is_deletion() {
            if pending.kvs.remove(&key).is_none() {
                debug!(key = %key, "Ignoring deletion of unknown key");
                self.metrics.updates_skipped.inc();
                return;
            }
        } else {
            pending.kvs.insert(key.clone(), update.clone());
        }

        match pending.batch_index.get(&key).copied() {
            Some(slot) if update.is_deletion() && !pending.published.contains_key(&key) => {
                // Created and deleted within this batch: nothing to publish.
                pending.batch[slot] = None;
                pending.batch_index.remove(&key);
                pending.batch_len -= 1;
            }
            Some(slot) => {
                pending.batch[slot] = Some(update);
            }
            None => {
                pending.batch_index.insert(key, pending.batch.len());
                pending.batch.push(Some(update));
                pending.batch_len += 1;
            }
        }
    }

    fn publish_locked(&self, pending: &mut PendingState) {
        let updates: Vec<SerializedUpdate> = pending.batch.drain(..).flatten().collect();
        pending.batch_index.clear();
        pending.batch_len = 0;
        pending.seq += 1;
        pending.published = pending.kvs.clone();

        let crumb = Arc::new(Breadcrumb::new(
            pending.seq,
            pending.status,
            updates,
            pending.kvs.clone(),
        ));

        let previous = self.current_breadcrumb();
        previous.link(Arc::clone(&crumb));
        *self.current.write() = Arc::clone(&crumb);

        self.metrics.breadcrumb_seq_number.set(crumb.seq as i64);
        self.metrics.breadcrumb_size.set(crumb.updates.len() as i64);
        self.metrics.snapshot_kvs.set(crumb.kvs.len() as i64);

        debug!(
            seq = crumb.seq,
            updates = crumb.updates.len(),
            kvs = crumb.kvs.len(),
            status = %crumb.status,
            "Published breadcrumb"
        );
    }
}

impl SyncerCallbacks for SnapshotCache {
    fn on_updates(&self, updates: Vec<Update>) {
        let _writer = self.enter_writer();
        let mut pending = self.pending.lock();

        for update in updates {
            let serialized = match SerializedUpdate::from_update(&update) {
                Ok(serialized) => serialized,
                Err(e) => {
                    warn!(key = %update.kv.key, ?e, "Skipping unserializable update");
                    self.metrics.updates_skipped.inc();
                    continue;
                }
            };

            self.apply(&mut pending, serialized);
            if pending.batch_len >= self.config.max_batch_size {
                self.publish_locked(&mut pending);
            }
        }
    }

    fn on_status_updated(&self, status: SyncStatus) {
        let _writer = self.enter_writer();
        let mut pending = self.pending.lock();

        if pending.status == status {
            debug!(%status, "Ignoring repeated status");
            return;
        }

        info!(from = %pending.status, to = %status, "Datastore status changed");
        pending.status = status;
        self.publish_locked(&mut pending);
    }
}
