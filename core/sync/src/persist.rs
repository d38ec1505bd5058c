//! Debounced persistence for state changes made outside sync runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::store::StateStore;

/// Cheap handle for requesting a persist.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl PersistHandle {
    /// Request a persist once the quiet period passes without further requests.
    pub fn schedule(&self) {
        if self.tx.send(()).is_err() {
            warn!("Persist requested after debouncer stopped");
        }
    }
}

/// Background task that writes the state store after a quiet period.
///
/// Every request restarts the quiet period. Writes are skipped while a
/// transaction is open; its commit persists instead.
pub struct PersistDebouncer {
    handle: PersistHandle,
    task: JoinHandle<()>,
}

impl PersistDebouncer {
    pub fn spawn(store: Arc<RwLock<StateStore>>, quiet: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce_loop(store, quiet, rx));
        Self {
            handle: PersistHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> PersistHandle {
        self.handle.clone()
    }

    pub fn schedule(&self) {
        self.handle.schedule();
    }

    /// Stop the task, flushing any pending change first.
    ///
    /// Handles still held elsewhere keep the task alive until they are dropped.
    pub async fn shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.task.await {
            error!("Persist task failed: {}", e);
        }
    }
}

async fn debounce_loop(
    store: Arc<RwLock<StateStore>>,
    quiet: Duration,
    mut rx: mpsc::UnboundedReceiver<()>,
) {
    let mut pending = false;
    loop {
        if !pending {
            match rx.recv().await {
                Some(()) => pending = true,
                None => break,
            }
            continue;
        }

        tokio::select! {
            request = rx.recv() => {
                if request.is_none() {
                    flush(&store).await;
                    break;
                }
            }
            _ = sleep(quiet) => {
                flush(&store).await;
                pending = false;
            }
        }
    }
    debug!("Persist debouncer stopped");
}

async fn flush(store: &RwLock<StateStore>) {
    let mut store = store.write().await;
    if store.has_open_transaction() {
        debug!("Transaction open, leaving persist to commit");
        return;
    }
    if !store.is_dirty() {
        return;
    }
    if let Err(e) = store.persist().await {
        error!("Failed to persist sync state: {}", e);
    }
}
