//! Sync scheduling: single-flight execution of manual and periodic runs.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use minutesync_common::{Error, Result};

use crate::engine::{SyncOptions, SyncReport};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Runs only when requested.
    Manual,
    /// Also runs at regular intervals while the queue is idle.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// A queued run request.
#[derive(Debug)]
struct SyncRequest {
    options: SyncOptions,
    reply: Reply,
}

/// Front end of the scheduler: submits requests and controls the worker.
///
/// Requests are queued in a bounded FIFO and executed one at a time. A request
/// that does not fit in the queue fails immediately.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<SyncRequest>,
    /// Cancellation for the run in progress.
    current: Arc<Mutex<Option<CancellationToken>>>,
    /// Shutdown signal.
    shutdown: CancellationToken,
    capacity: usize,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode and queue capacity.
    pub fn new(mode: SyncMode, capacity: usize) -> (Self, SyncSchedulerHandle) {
        let capacity = capacity.max(1);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let mode = Arc::new(RwLock::new(mode));
        let current = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            current: current.clone(),
            shutdown: shutdown.clone(),
            capacity,
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            current,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Queue a run and wait for its report.
    ///
    /// # Errors
    /// - `QueueFull` if the queue is at capacity
    /// - `Cancelled` if the scheduler shuts down before the run completes
    pub async fn request_sync(&self, options: SyncOptions) -> Result<SyncReport> {
        let (reply, response) = oneshot::channel();

        self.request_tx
            .try_send(SyncRequest { options, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Sync request rejected: queue full");
                    Error::QueueFull {
                        capacity: self.capacity,
                    }
                }
                mpsc::error::TrySendError::Closed(_) => Error::Cancelled,
            })?;

        response.await.map_err(|_| Error::Cancelled)?
    }

    /// Cancel the run in progress, if any. Queued requests still run.
    pub async fn cancel_current(&self) -> bool {
        match self.current.lock().await.as_ref() {
            Some(token) => {
                info!("Cancelling current sync");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the worker. The current run is cancelled and queued requests are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<SyncRequest>,
    current: Arc<Mutex<Option<CancellationToken>>>,
    shutdown: CancellationToken,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` performs one run; it is
    /// never called concurrently with itself.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncOptions, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let mut active_interval = self.mode.read().await.interval();
        let mut ticker = active_interval.map(periodic);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                request = self.request_rx.recv() => {
                    let Some(SyncRequest { options, reply }) = request else {
                        info!("All schedulers dropped, stopping");
                        break;
                    };
                    debug!("Processing sync request: {:?}", options);
                    let result = self.execute(&sync_fn, options).await;
                    let _ = reply.send(result);
                }

                _ = wait_for_periodic(&mut ticker) => {
                    if self.request_rx.is_empty() {
                        debug!("Triggering periodic sync");
                        match self.execute(&sync_fn, SyncOptions::default()).await {
                            Ok(report) => info!(
                                "Periodic sync completed: {} created, {} updated, {} skipped",
                                report.created, report.updated, report.skipped
                            ),
                            Err(e) => error!("Periodic sync failed: {}", e),
                        }
                    }
                }
            }

            // Recreate interval if mode changed
            let expected = self.mode.read().await.interval();
            if expected != active_interval {
                active_interval = expected;
                ticker = active_interval.map(periodic);
            }
        }

        self.request_rx.close();
    }

    async fn execute<F, Fut>(&self, sync_fn: &F, options: SyncOptions) -> Result<SyncReport>
    where
        F: Fn(SyncOptions, CancellationToken) -> Fut,
        Fut: Future<Output = Result<SyncReport>>,
    {
        let token = self.shutdown.child_token();
        *self.current.lock().await = Some(token.clone());
        let result = sync_fn(options, token).await;
        *self.current.lock().await = None;
        result
    }
}

fn periodic(every: Duration) -> Interval {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
