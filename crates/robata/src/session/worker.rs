//! Handle type for the background task that drives one generation turn.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::task::JoinHandle;

/// A handle for managing an in-flight generation turn.
///
/// The turn runs on a spawned Tokio task; the handle carries a cancellation
/// flag the task polls between engine steps, and the join handle for waiting
/// on completion. Dropping the handle requests cancellation and detaches the
/// task so it can wind down on its own.
pub(crate) struct TurnHandle {
    /// Set to request the turn stop at the next step boundary
    cancelled: Arc<AtomicBool>,

    /// Handle to the spawned task, becomes `None` once joined
    handle: Option<JoinHandle<()>>,
}

impl TurnHandle {
    /// Spawns a turn via `task`, which receives the cancellation flag and
    /// returns the `JoinHandle` of the task it spawned.
    pub fn spawn<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) -> JoinHandle<()>,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = task(cancelled.clone());
        Self {
            cancelled,
            handle: Some(handle),
        }
    }

    /// Requests cancellation. The turn observes the flag before its next
    /// engine step and emits a `Cancelled` event with the partial output.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Waits for the turn task to finish.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TurnHandle {
    /// Requests cancellation and detaches the task when the handle is dropped.
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                let _ = handle.await;
            });
        }
    }
}
