//! # State Recorder
//!
//! An in-memory sink that mirrors the stream it receives: the current value
//! of every key (by default path) and the latest status.
//!
//! Agents that only need "what is the state right now" can use it directly;
//! the test suites use it to compare what a client converged to.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::callbacks::SyncerCallbacks;
use crate::types::{SyncStatus, Update};

#[derive(Debug, Default)]
struct RecorderState {
    kvs: BTreeMap<String, Update>,
    status: Option<SyncStatus>,
    status_changes: usize,
    /// Every `on_updates` batch, kept only when history is enabled.
    history: Option<Vec<Vec<Update>>>,
}

/// Records the state delivered through [`SyncerCallbacks`].
#[derive(Debug, Default)]
pub struct StateRecorder {
    state: Mutex<RecorderState>,
}

impl StateRecorder {
    /// Creates a recorder that keeps only the current state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that also keeps every batch it receives.
    pub fn with_history() -> Self {
        StateRecorder {
            state: Mutex::new(RecorderState {
                history: Some(Vec::new()),
                ..Default::default()
            }),
        }
    }

    /// Latest status, `None` until the first status arrives.
    pub fn status(&self) -> Option<SyncStatus> {
        self.state.lock().status
    }

    /// Number of status transitions received.
    pub fn status_changes(&self) -> usize {
        self.state.lock().status_changes
    }

    /// Current key → update map.
    pub fn kvs(&self) -> BTreeMap<String, Update> {
        self.state.lock().kvs.clone()
    }

    /// Current value for a path.
    pub fn get(&self, path: &str) -> Option<Update> {
        self.state.lock().kvs.get(path).cloned()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.state.lock().kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches received so far; empty unless created with [`with_history`].
    ///
    /// [`with_history`]: StateRecorder::with_history
    pub fn batches(&self) -> Vec<Vec<Update>> {
        self.state.lock().history.clone().unwrap_or_default()
    }
}

impl SyncerCallbacks for StateRecorder {
    fn on_updates(&self, updates: Vec<Update>) {
        let mut state = self.state.lock();
        for update in &updates {
            let path = update
                .kv
                .key
                .default_path()
                .unwrap_or_else(|_| update.kv.key.to_string());
            if update.is_deletion() {
                state.kvs.remove(&path);
            } else {
                state.kvs.insert(path, update.clone());
            }
        }
        if let Some(history) = state.history.as_mut() {
            history.push(updates);
        }
    }

    fn on_status_updated(&self, status: SyncStatus) {
        let mut state = self.state.lock();
        state.status = Some(status);
        state.status_changes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKey;

    #[test]
    fn test_records_puts_and_deletes() {
        let recorder = StateRecorder::new();
        recorder.on_updates(vec![
            Update::new(ResourceKey::global_config("foobar"), "bazzbiff".into(), "1"),
            Update::new(ResourceKey::global_config("foobar2"), "bazzbiff".into(), "2"),
        ]);
        recorder.on_updates(vec![Update::deletion(ResourceKey::global_config("foobar"), "3")]);

        assert_eq!(recorder.len(), 1);
        assert!(recorder.get("/calico/v1/config/foobar").is_none());
        assert!(recorder.get("/calico/v1/config/foobar2").is_some());
        assert!(recorder.batches().is_empty());
    }

    #[test]
    fn test_records_status_and_history() {
        let recorder = StateRecorder::with_history();
        assert_eq!(recorder.status(), None);

        recorder.on_status_updated(SyncStatus::ResyncInProgress);
        recorder.on_updates(vec![Update::new(
            ResourceKey::global_config("a"),
            "1".into(),
            "1",
        )]);
        recorder.on_status_updated(SyncStatus::InSync);

        assert_eq!(recorder.status(), Some(SyncStatus::InSync));
        assert_eq!(recorder.status_changes(), 2);
        assert_eq!(recorder.batches().len(), 1);
    }
}
