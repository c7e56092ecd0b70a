//! # Callbacks Decoupler
//!
//! Moves `SyncerCallbacks` calls from the producer's thread onto a task of
//! their own, so a datastore watcher never waits on the validation stage or
//! the cache.
//!
//! ```text
//!  producer ──on_updates()──▶ [ unbounded channel ] ──send_to()──▶ sink
//!           ──on_status()───▶                        (one task)
//! ```
//!
//! Events are delivered in the order they were produced.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::{SyncStatus, SyncerCallbacks, Update};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::Finished;

#[derive(Debug)]
enum DecouplerEvent {
    Updates(Vec<Update>),
    Status(SyncStatus),
}

/// Queues callbacks and replays them to a sink from a dedicated task.
pub struct SyncerCallbacksDecoupler {
    tx: mpsc::UnboundedSender<DecouplerEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DecouplerEvent>>>,
}

impl Default for SyncerCallbacksDecoupler {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncerCallbacksDecoupler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Replays queued events to `sink` until `cancel` fires.
    ///
    /// ## Errors
    /// The queue can be drained by one consumer only; a second call fails.
    pub async fn send_to<S>(&self, cancel: CancellationToken, sink: S) -> SyncResult<()>
    where
        S: SyncerCallbacks,
    {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::Internal("decoupler already has a consumer".into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Decoupler consumer stopping");
                    return Ok(());
                }
                event = rx.recv() => match event {
                    Some(DecouplerEvent::Updates(updates)) => sink.on_updates(updates),
                    Some(DecouplerEvent::Status(status)) => sink.on_status_updated(status),
                    // Unreachable while `self` holds the sender.
                    None => return Ok(()),
                },
            }
        }
    }

    /// Spawns [`send_to`](Self::send_to) on its own task.
    pub fn spawn_send_to<S>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        sink: S,
    ) -> Finished
    where
        S: SyncerCallbacks + 'static,
    {
        let (finished, guard) = Finished::new();
        let decoupler = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = decoupler.send_to(cancel, sink).await {
                info!(?e, "Decoupler consumer not started");
            }
        });

        finished
    }

    fn push(&self, event: DecouplerEvent) {
        if self.tx.send(event).is_err() {
            debug!("Decoupler receiver gone; dropping event");
        }
    }
}

impl SyncerCallbacks for SyncerCallbacksDecoupler {
    fn on_updates(&self, updates: Vec<Update>) {
        self.push(DecouplerEvent::Updates(updates));
    }

    fn on_status_updated(&self, status: SyncStatus) {
        self.push(DecouplerEvent::Status(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::{ResourceKey, StateRecorder};

    #[tokio::test]
    async fn test_events_replayed_in_order() {
        let decoupler = Arc::new(SyncerCallbacksDecoupler::new());
        let recorder = Arc::new(StateRecorder::with_history());
        let cancel = CancellationToken::new();

        decoupler.on_status_updated(SyncStatus::ResyncInProgress);
        decoupler.on_updates(vec![Update::new(
            ResourceKey::global_config("foobar"),
            "bazzbiff".into(),
            "1",
        )]);
        decoupler.on_status_updated(SyncStatus::InSync);

        let finished = decoupler.spawn_send_to(cancel.clone(), recorder.clone());

        for _ in 0..100 {
            if recorder.status() == Some(SyncStatus::InSync) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.status(), Some(SyncStatus::InSync));
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.batches().len(), 1);

        cancel.cancel();
        finished.wait().await;
    }

    #[tokio::test]
    async fn test_second_consumer_rejected() {
        let decoupler = Arc::new(SyncerCallbacksDecoupler::new());
        let cancel = CancellationToken::new();
        let first = decoupler.spawn_send_to(cancel.clone(), StateRecorder::new());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = decoupler
            .send_to(cancel.clone(), StateRecorder::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));

        cancel.cancel();
        first.wait().await;
    }
}
