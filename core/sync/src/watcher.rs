//! Applies local file events to the state store.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use minutesync_storage::FileEvent;

use crate::persist::PersistHandle;
use crate::store::StateStore;

/// Single consumer of file events.
///
/// Events are applied one at a time; the store defers any that arrive during a
/// transaction. Each change schedules a debounced persist.
pub struct EventPump {
    store: Arc<RwLock<StateStore>>,
    persist: PersistHandle,
}

impl EventPump {
    pub fn new(store: Arc<RwLock<StateStore>>, persist: PersistHandle) -> Self {
        Self { store, persist }
    }

    /// Apply events until the channel closes or `shutdown` fires.
    ///
    /// Returns the number of events that changed state.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<FileEvent>,
        shutdown: CancellationToken,
    ) -> usize {
        let mut applied = 0;
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            debug!("File event: {:?}", event);
            let result = self.store.write().await.apply_event(event).await;
            match result {
                Ok(true) => {
                    applied += 1;
                    self.persist.schedule();
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to apply file event: {}", e),
            }
        }
        info!("Event pump stopped after {} state changes", applied);
        applied
    }
}
