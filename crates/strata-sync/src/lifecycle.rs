//! # Task Lifecycle
//!
//! The `Finished` signal lets an owner wait until a background component
//! (cache wake-up task, server, client session) has fully exited after
//! its cancellation token fired.
//!
//! ```text
//! owner                              component task
//!   │  cancel.cancel()                     │
//!   │ ───────────────────────────────────▶ │ stops, joins children
//!   │                                      │ drops FinishedGuard
//!   │  finished.wait() ◀───────────────────┘
//! ```

use tokio_util::sync::CancellationToken;

/// Awaitable completion of a background component.
#[derive(Debug, Clone)]
pub struct Finished {
    done: CancellationToken,
}

/// Marks its [`Finished`] complete when dropped.
///
/// Held by the component's task so that completion is signalled on every
/// exit path, including panics.
#[derive(Debug)]
pub struct FinishedGuard {
    done: CancellationToken,
}

impl Finished {
    /// Creates a signal and the guard that completes it.
    pub fn new() -> (Finished, FinishedGuard) {
        let done = CancellationToken::new();
        (
            Finished { done: done.clone() },
            FinishedGuard { done },
        )
    }

    /// Waits until the component has exited.
    pub async fn wait(&self) {
        self.done.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.done.cancel();
    }
}
