//! Core sync engine that orchestrates a reconciliation run.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use minutesync_common::{Error, Result};
use minutesync_storage::{FileStore, Item, RemoteSource, SecondaryResource};

use crate::batch::{BatchConfig, BatchSizer};
use crate::conflict::{detect_conflict, ConflictPolicy, LocalFacts, Resolution, ResolutionTable};
use crate::fetch::{FetchConfig, FetchCoordinator};
use crate::rate_limit::RateLimitConfig;
use crate::render::{ContentRenderer, DatePathGenerator, MarkdownRenderer, PathGenerator};
use crate::retry::RetryConfig;
use crate::store::{InitOutcome, StateStore, DEFAULT_FRONTMATTER_KEY};
use crate::writer::{DocumentWriter, MergeBoundary, WriteAction};

/// Static item filter applied after listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemFilter {
    /// Skip meetings that have not finished yet.
    pub only_completed: bool,
    /// Remote ids never synced.
    pub exclude_ids: Vec<String>,
}

impl ItemFilter {
    pub fn accepts(&self, item: &Item) -> bool {
        if self.only_completed && !item.completed {
            return false;
        }
        !self.exclude_ids.iter().any(|id| id == item.id.as_str())
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub fetch: FetchConfig,
    /// Pending run requests the scheduler accepts.
    pub queue_capacity: usize,
    pub conflicts: ResolutionTable,
    pub merge_boundary: MergeBoundary,
    pub filter: ItemFilter,
    /// Quiet period before event-driven state changes are persisted.
    #[serde(with = "crate::duration_ms")]
    pub persist_debounce: Duration,
    /// Frontmatter key that ties a file to its remote item.
    pub frontmatter_key: String,
    /// Mirror folder new items are placed in.
    pub folder: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            fetch: FetchConfig::default(),
            queue_capacity: 10,
            conflicts: ResolutionTable::default(),
            merge_boundary: MergeBoundary::default(),
            filter: ItemFilter::default(),
            persist_debounce: Duration::from_secs(2),
            frontmatter_key: DEFAULT_FRONTMATTER_KEY.to_string(),
            folder: "Meetings".to_string(),
        }
    }
}

/// Run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    Connecting,
    Fetching,
    Processing,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Complete | SyncPhase::Failed | SyncPhase::Cancelled)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Fetching) | (Fetching, Processing) | (Processing, Finalizing) => true,
            (Finalizing, Complete | Failed | Cancelled) => true,
            // Fatal errors before any writes end the run directly.
            (Connecting | Fetching | Processing, Failed) => true,
            (Connecting | Fetching | Processing, Cancelled) => true,
            (Complete | Failed | Cancelled, Idle) => true,
            _ => false,
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// List every item instead of only those changed since the last sync.
    pub full: bool,
}

/// Progress snapshot passed to the progress callback after each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub processed: usize,
    pub total: usize,
    pub batch_size: usize,
}

/// Progress callback. Runs on the sync task; keep it short.
pub type ProgressFn = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// One failure recorded in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorRecord {
    pub item_id: Option<String>,
    pub item_title: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<SyncErrorRecord>,
    pub duration_ms: u64,
}

impl SyncReport {
    fn record_error(&mut self, item: Option<&Item>, message: impl Into<String>) {
        self.errors.push(SyncErrorRecord {
            item_id: item.map(|i| i.id.to_string()),
            item_title: item.map(|i| i.title.clone()),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

enum ItemOutcome {
    Created,
    Updated,
    Skipped,
}

/// Main sync engine for mirroring the remote collection.
pub struct SyncEngine {
    /// Remote access.
    fetch: FetchCoordinator,
    /// Local file store.
    files: Arc<dyn FileStore>,
    /// Sync state, shared with the file event pump.
    store: Arc<RwLock<StateStore>>,
    /// Conflict policy.
    policy: Arc<dyn ConflictPolicy>,
    renderer: Arc<dyn ContentRenderer>,
    paths: Arc<dyn PathGenerator>,
    progress: Option<ProgressFn>,
    phase: RwLock<SyncPhase>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create a new sync engine.
    ///
    /// `store` must be backed by `files`.
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        files: Arc<dyn FileStore>,
        store: Arc<RwLock<StateStore>>,
        config: SyncConfig,
    ) -> Self {
        let fetch = FetchCoordinator::new(
            remote,
            config.rate_limit.clone(),
            config.retry.clone(),
            config.fetch.clone(),
        );
        Self {
            fetch,
            files,
            store,
            policy: Arc::new(config.conflicts),
            renderer: Arc::new(MarkdownRenderer::new(config.frontmatter_key.clone())),
            paths: Arc::new(DatePathGenerator::new(config.folder.clone())),
            progress: None,
            phase: RwLock::new(SyncPhase::Idle),
            config,
        }
    }

    /// Replace the conflict policy.
    pub fn with_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the content renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn ContentRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Replace the path generator.
    pub fn with_path_generator(mut self, paths: Arc<dyn PathGenerator>) -> Self {
        self.paths = paths;
        self
    }

    /// Receive progress after every batch.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Load persisted state.
    pub async fn initialize(&self) -> InitOutcome {
        self.store.write().await.initialize().await
    }

    /// Get a reference to the sync state.
    pub fn store(&self) -> Arc<RwLock<StateStore>> {
        self.store.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn phase(&self) -> SyncPhase {
        *self.phase.read().await
    }

    async fn transition(&self, next: SyncPhase) {
        let mut phase = self.phase.write().await;
        if !phase.can_transition_to(next) {
            error!("Unexpected phase transition {:?} -> {:?}", *phase, next);
        }
        debug!("Sync phase {:?} -> {:?}", *phase, next);
        *phase = next;
    }

    /// Run one reconciliation.
    ///
    /// Failures during the run end up in the report. Cancellation is observed
    /// between batches and rolls the run back.
    ///
    /// # Errors
    /// - `SyncInProgress` if a run is already active
    /// - `TransactionConflict` if the state store already has an open transaction
    pub fn run(
        &self,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<SyncReport>> {
        self.run_to_end(options, cancel).boxed()
    }

    async fn run_to_end(&self, options: SyncOptions, cancel: CancellationToken) -> Result<SyncReport> {
        {
            let mut phase = self.phase.write().await;
            if *phase != SyncPhase::Idle {
                return Err(Error::SyncInProgress);
            }
            *phase = SyncPhase::Connecting;
        }

        let started = Instant::now();
        let mut report = SyncReport::default();
        let outcome = self.execute(options, &cancel, &mut report).await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        let terminal = match &outcome {
            Ok(phase) => *phase,
            Err(_) => SyncPhase::Failed,
        };
        self.transition(terminal).await;
        report.success = terminal == SyncPhase::Complete;
        self.transition(SyncPhase::Idle).await;

        outcome?;
        info!(
            "Sync {:?}: {} created, {} updated, {} skipped, {} errors in {}ms",
            terminal,
            report.created,
            report.updated,
            report.skipped,
            report.errors.len(),
            report.duration_ms
        );
        Ok(report)
    }

    async fn execute(
        &self,
        options: SyncOptions,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<SyncPhase> {
        info!("Connecting to {}", self.fetch.remote_name());
        match self.fetch.test_connection().await {
            Ok(true) => {}
            Ok(false) => {
                error!("Remote {} is unreachable", self.fetch.remote_name());
                report.record_error(None, "connection failed: remote is unreachable");
                return Ok(SyncPhase::Failed);
            }
            Err(e) => {
                error!("Connection check failed: {}", e);
                report.record_error(None, format!("connection failed: {}", e));
                return Ok(SyncPhase::Failed);
            }
        }

        self.transition(SyncPhase::Fetching).await;
        let fetched_at = Utc::now();
        let since = if options.full {
            None
        } else {
            self.store.read().await.state().last_sync
        };
        let items = match self.fetch.list_items(since).await {
            Ok(items) => items,
            Err(e) => {
                error!("Listing failed: {}", e);
                report.record_error(None, format!("connection failed: {}", e));
                return Ok(SyncPhase::Failed);
            }
        };
        let items = self.filter_items(items);

        if cancel.is_cancelled() {
            report.record_error(None, "sync cancelled");
            return Ok(SyncPhase::Cancelled);
        }

        self.transition(SyncPhase::Processing).await;
        self.store
            .write()
            .await
            .begin_transaction(Uuid::new_v4().to_string())?;

        let writer = DocumentWriter::new(
            self.files.clone(),
            self.renderer.clone(),
            self.paths.clone(),
            self.config.merge_boundary,
            self.config.frontmatter_key.clone(),
        );

        let total = items.len();
        let mut sizer = BatchSizer::for_total(self.config.batch.clone(), total);
        let mut processed = 0;
        let mut cancelled = false;
        info!("Processing {} items (batch size {})", total, sizer.current());

        while processed < total {
            if cancel.is_cancelled() {
                warn!("Sync cancelled after {} of {} items", processed, total);
                report.record_error(None, "sync cancelled");
                cancelled = true;
                break;
            }

            let end = (processed + sizer.current()).min(total);
            let batch = &items[processed..end];
            let batch_started = Instant::now();

            let wanted: Vec<Item> = {
                let store = self.store.read().await;
                batch
                    .iter()
                    .filter(|item| !store.is_tombstoned(&item.id))
                    .cloned()
                    .collect()
            };
            let secondaries = self.fetch.fetch_secondaries(&wanted).await;

            {
                let mut store = self.store.write().await;
                for item in batch {
                    let resources = secondaries
                        .get(&item.id)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    match self.process_item(&mut store, &writer, item, resources).await {
                        Ok(ItemOutcome::Created) => report.created += 1,
                        Ok(ItemOutcome::Updated) => report.updated += 1,
                        Ok(ItemOutcome::Skipped) => report.skipped += 1,
                        Err(e) => {
                            warn!("Failed to sync {} ({}): {}", item.id, item.title, e);
                            report.skipped += 1;
                            report.record_error(Some(item), e.to_string());
                        }
                    }
                }
            }

            processed = end;
            let next = sizer.adjust(batch.len(), batch_started.elapsed());
            debug!(
                "Batch of {} done in {:?}, next batch size {}",
                batch.len(),
                batch_started.elapsed(),
                next
            );
            if let Some(progress) = &self.progress {
                progress(&SyncProgress {
                    phase: SyncPhase::Processing,
                    processed,
                    total,
                    batch_size: next,
                });
            }
        }

        self.transition(SyncPhase::Finalizing).await;
        let mut store = self.store.write().await;
        if cancelled {
            store.rollback_transaction().await?;
            return Ok(SyncPhase::Cancelled);
        }

        let item_failures = report.errors.iter().any(|e| e.item_id.is_some());
        if store.pending_operations() > 0 && !item_failures {
            store.set_last_sync(fetched_at);
        }
        match store.commit_transaction().await {
            Ok(()) => Ok(SyncPhase::Complete),
            Err(e) => {
                error!("Failed to persist sync state: {}", e);
                report.record_error(None, format!("failed to persist state: {}", e));
                Ok(SyncPhase::Failed)
            }
        }
    }

    /// Drop filtered and duplicate items, keeping listing order.
    fn filter_items(&self, items: Vec<Item>) -> Vec<Item> {
        let listed = items.len();
        let mut seen = HashSet::new();
        let items: Vec<Item> = items
            .into_iter()
            .filter(|item| self.config.filter.accepts(item))
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        if items.len() != listed {
            debug!("Filtered {} of {} listed items", listed - items.len(), listed);
        }
        items
    }

    async fn process_item(
        &self,
        store: &mut StateStore,
        writer: &DocumentWriter,
        item: &Item,
        secondaries: &[SecondaryResource],
    ) -> Result<ItemOutcome> {
        if store.is_tombstoned(&item.id) {
            debug!("Skipping tombstoned item {}", item.id);
            return Ok(ItemOutcome::Skipped);
        }

        let prior = store.get(&item.id).cloned();
        let local = match &prior {
            Some(meta) => match self.files.modified(&meta.path).await? {
                Some(mtime) => LocalFacts::present(mtime),
                None => LocalFacts::missing(),
            },
            None => LocalFacts::missing(),
        };

        let conflict = detect_conflict(&item.id, item.updated_at, prior.as_ref(), local);
        let resolution = self.policy.resolve(&conflict);
        if conflict.is_conflict() {
            info!(
                "Conflict on {} ({:?}), resolved as {:?}",
                item.id, conflict.kind, resolution
            );
        }
        if resolution == Resolution::Skip {
            return Ok(ItemOutcome::Skipped);
        }

        let outcome = writer.write(store, item, secondaries, resolution).await?;
        let version = prior.as_ref().map_or(1, |meta| meta.sync_version + 1);

        let result = match outcome.action {
            WriteAction::Unchanged => return Ok(ItemOutcome::Skipped),
            WriteAction::Created => ItemOutcome::Created,
            WriteAction::Updated => ItemOutcome::Updated,
            WriteAction::MergedIntoLocal => ItemOutcome::Skipped,
        };
        store
            .add_or_update(&item.id, &outcome.path, outcome.content_hash, version)
            .await?;
        debug!("{:?} {} at {} (v{})", outcome.action, item.id, outcome.path, version);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::AlwaysKeepRemote;
    use crate::store::state_dir_for;
    use chrono::TimeZone;
    use minutesync_common::{MirrorPath, RemoteId};
    use minutesync_storage::{FileEvent, LocalFileStore, MemoryRemote, Panel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn id(s: &str) -> RemoteId {
        RemoteId::new(s).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0).unwrap()
    }

    fn meeting(n: u32) -> Item {
        Item::new(id(&format!("m-{}", n)), format!("Meeting {}", n), at(n))
            .with_notes(format!("Notes for meeting {}", n))
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            retry: RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            rate_limit: RateLimitConfig {
                max_calls: 10_000,
                ..RateLimitConfig::default()
            },
            ..SyncConfig::default()
        }
    }

    struct Harness {
        dir: TempDir,
        remote: Arc<MemoryRemote>,
        files: Arc<dyn FileStore>,
        store: Arc<RwLock<StateStore>>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir.path()).unwrap());
            let mut store = StateStore::new(files.clone(), state_dir_for(dir.path()));
            store.initialize().await;
            Self {
                dir,
                remote: Arc::new(MemoryRemote::new()),
                files,
                store: Arc::new(RwLock::new(store)),
            }
        }

        fn engine(&self, config: SyncConfig) -> SyncEngine {
            SyncEngine::new(
                self.remote.clone(),
                self.files.clone(),
                self.store.clone(),
                config,
            )
        }

        async fn path_of(&self, remote_id: &str) -> MirrorPath {
            self.store.read().await.get(&id(remote_id)).unwrap().path.clone()
        }

        async fn checksum(&self) -> String {
            self.store.read().await.state().compute_checksum()
        }
    }

    async fn run(engine: &SyncEngine, full: bool) -> SyncReport {
        engine
            .run(SyncOptions { full }, CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initial_sync_creates_all_items() {
        let h = Harness::new().await;
        for n in 1..=3 {
            h.remote.upsert_item(meeting(n));
        }
        h.remote.set_secondary(
            id("m-1"),
            SecondaryResource::Panels(vec![Panel {
                id: "p".to_string(),
                title: "Decisions".to_string(),
                content: "- ship friday".to_string(),
            }]),
        );

        let engine = h.engine(test_config());
        let report = run(&engine, false).await;

        assert!(report.success);
        assert_eq!(report.created, 3);
        assert_eq!((report.updated, report.skipped), (0, 0));
        assert!(report.errors.is_empty());

        let store = h.store.read().await;
        assert_eq!(store.state().files.len(), 3);
        assert!(store.state().last_sync.is_some());
        for meta in store.state().files.values() {
            assert_eq!(meta.sync_version, 1);
            assert!(h.files.exists(&meta.path).await.unwrap());
        }
        let first = h.files.read(&store.get(&id("m-1")).unwrap().path).await.unwrap();
        assert!(first.contains("## Decisions"));
        assert_eq!(engine.phase().await, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let h = Harness::new().await;
        for n in 1..=4 {
            h.remote.upsert_item(meeting(n));
        }
        let engine = h.engine(test_config());
        run(&engine, false).await;
        let checksum = h.checksum().await;
        let last_sync = h.store.read().await.state().last_sync;

        let incremental = run(&engine, false).await;
        assert!(incremental.success);
        assert_eq!((incremental.created, incremental.updated), (0, 0));
        assert_eq!(h.checksum().await, checksum);

        let full = run(&engine, true).await;
        assert_eq!((full.created, full.updated, full.skipped), (0, 0, 4));
        assert_eq!(h.checksum().await, checksum);
        assert_eq!(h.store.read().await.state().last_sync, last_sync);
    }

    #[tokio::test]
    async fn user_edit_is_kept_and_version_bumps() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        let engine = h.engine(test_config());
        run(&engine, false).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let path = h.path_of("m-1").await;
        h.files
            .write(&path, "---\nremote_id: m-1\n---\n# Meeting 1\n\nMy own notes.\n")
            .await
            .unwrap();

        h.remote.upsert_item(
            meeting(1)
                .with_notes("Revised remote notes")
                .updated(Utc::now()),
        );
        let report = run(&engine, false).await;

        assert!(report.success);
        assert_eq!((report.created, report.updated, report.skipped), (0, 0, 1));
        let text = h.files.read(&path).await.unwrap();
        assert!(text.contains("My own notes."));
        assert!(text.contains("Revised remote notes"));
        assert_eq!(h.store.read().await.get(&id("m-1")).unwrap().sync_version, 2);
    }

    #[tokio::test]
    async fn keep_remote_policy_overwrites_user_edit() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        let engine = h.engine(test_config()).with_policy(Arc::new(AlwaysKeepRemote));
        run(&engine, false).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let path = h.path_of("m-1").await;
        h.files.write(&path, "scribbles").await.unwrap();

        h.remote
            .upsert_item(meeting(1).with_notes("Remote wins").updated(Utc::now()));
        let report = run(&engine, false).await;

        assert_eq!(report.updated, 1);
        let text = h.files.read(&path).await.unwrap();
        assert!(!text.contains("scribbles"));
        assert!(text.contains("Remote wins"));
    }

    #[tokio::test]
    async fn listing_failure_reports_connection_failed() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        h.remote.fail_listing(10, "connection reset");
        let checksum = h.checksum().await;

        let engine = h.engine(test_config());
        let report = run(&engine, false).await;

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.starts_with("connection failed"));
        assert!(report.errors[0].item_id.is_none());
        assert!(h.files.list_files().await.unwrap().is_empty());
        assert_eq!(h.checksum().await, checksum);
        assert_eq!(engine.phase().await, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn unreachable_remote_fails_before_writes() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        h.remote.set_unreachable(true);

        let report = run(&h.engine(test_config()), false).await;
        assert!(!report.success);
        assert!(report.errors[0].message.starts_with("connection failed"));
        assert_eq!(h.remote.stats().list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tombstoned_item_is_never_recreated() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        h.remote.upsert_item(meeting(2));
        let engine = h.engine(test_config());
        run(&engine, false).await;

        let path = h.path_of("m-1").await;
        h.files.delete(&path).await.unwrap();
        {
            let mut store = h.store.write().await;
            assert!(store.apply_event(FileEvent::Deleted(path.clone())).await.unwrap());
            store.persist().await.unwrap();
        }

        h.remote
            .upsert_item(meeting(1).with_notes("changed upstream").updated(Utc::now()));
        for full in [false, true] {
            let report = run(&engine, full).await;
            assert!(report.success);
            assert_eq!(report.created, 0);
            assert!(!h.files.exists(&path).await.unwrap());
        }

        let mut reopened = StateStore::new(h.files.clone(), state_dir_for(h.dir.path()));
        reopened.initialize().await;
        assert!(reopened.is_tombstoned(&id("m-1")));
        assert!(reopened.get(&id("m-1")).is_none());
        assert!(reopened.get(&id("m-2")).is_some());
    }

    #[tokio::test]
    async fn cancel_between_batches_rolls_back() {
        let h = Harness::new().await;
        for n in 1..=12 {
            h.remote.upsert_item(meeting(n));
        }
        let checksum = h.checksum().await;

        let cancel = CancellationToken::new();
        let batches = Arc::new(AtomicUsize::new(0));
        let progress: ProgressFn = {
            let cancel = cancel.clone();
            let batches = batches.clone();
            Arc::new(move |_p: &SyncProgress| {
                batches.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let engine = h.engine(test_config()).with_progress(progress);
        let report = engine.run(SyncOptions::default(), cancel).await.unwrap();

        assert!(!report.success);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
        assert!(report.errors.iter().any(|e| e.message.contains("cancelled")));
        {
            let store = h.store.read().await;
            assert!(store.state().files.is_empty());
            assert!(store.state().last_sync.is_none());
            assert!(!store.has_open_transaction());
        }
        assert_eq!(h.checksum().await, checksum);

        // Files written before the cancel are adopted on the next run.
        let report = run(&h.engine(test_config()), false).await;
        assert!(report.success);
        assert_eq!(report.created, 12);
        assert_eq!(h.files.list_files().await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn missing_file_is_skipped_by_default() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        let engine = h.engine(test_config());
        run(&engine, false).await;

        let path = h.path_of("m-1").await;
        h.files.delete(&path).await.unwrap();
        h.remote
            .upsert_item(meeting(1).with_notes("new").updated(Utc::now()));

        let report = run(&engine, false).await;
        assert_eq!(report.skipped, 1);
        assert!(!h.files.exists(&path).await.unwrap());
        assert!(!h.store.read().await.is_tombstoned(&id("m-1")));
    }

    #[tokio::test]
    async fn secondary_failure_still_writes_item() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        h.remote.fail_secondaries_for(id("m-1"));

        let report = run(&h.engine(test_config()), false).await;
        assert!(report.success);
        assert_eq!(report.created, 1);
        assert!(report.errors.is_empty());
    }

    struct FailingPaths {
        inner: DatePathGenerator,
        fail: RemoteId,
    }

    impl PathGenerator for FailingPaths {
        fn generate(&self, item: &Item) -> Result<MirrorPath> {
            if item.id == self.fail {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.inner.generate(item)
        }
    }

    #[tokio::test]
    async fn item_write_failure_is_isolated_and_holds_last_sync() {
        let h = Harness::new().await;
        for n in 1..=3 {
            h.remote.upsert_item(meeting(n));
        }

        let engine = h.engine(test_config()).with_path_generator(Arc::new(FailingPaths {
            inner: DatePathGenerator::default(),
            fail: id("m-2"),
        }));
        let report = run(&engine, false).await;

        assert_eq!(report.created, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item_id.as_deref(), Some("m-2"));
        assert!(report.errors[0].message.contains("disk full"));

        {
            let store = h.store.read().await;
            assert!(store.get(&id("m-1")).is_some());
            assert!(store.get(&id("m-2")).is_none());
            assert!(store.get(&id("m-3")).is_some());
            assert!(store.state().last_sync.is_none());
        }

        let mut reopened = StateStore::new(h.files.clone(), state_dir_for(h.dir.path()));
        reopened.initialize().await;
        assert!(reopened.get(&id("m-1")).is_some());
        assert!(reopened.get(&id("m-3")).is_some());

        let retry = run(&h.engine(test_config()), false).await;
        assert_eq!(retry.created, 1);
        assert!(retry.errors.is_empty());
        assert!(h.store.read().await.state().last_sync.is_some());
    }

    #[tokio::test]
    async fn filter_excludes_items() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        h.remote.upsert_item(meeting(2).in_progress());
        h.remote.upsert_item(meeting(3));

        let mut config = test_config();
        config.filter = ItemFilter {
            only_completed: true,
            exclude_ids: vec!["m-3".to_string()],
        };
        let report = run(&h.engine(config), false).await;

        assert_eq!(report.created, 1);
        let store = h.store.read().await;
        assert!(store.get(&id("m-1")).is_some());
        assert!(store.get(&id("m-2")).is_none());
        assert!(store.get(&id("m-3")).is_none());
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let h = Harness::new().await;
        h.remote.upsert_item(meeting(1));
        h.remote.set_latency(Duration::from_millis(200));
        let engine = Arc::new(h.engine(test_config()));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .run(SyncOptions::default(), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = engine
            .run(SyncOptions::default(), CancellationToken::new())
            .await;

        assert!(matches!(second, Err(Error::SyncInProgress)));
        assert!(first.await.unwrap().unwrap().success);
    }

    #[test]
    fn phase_transitions() {
        use SyncPhase::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(!Processing.can_transition_to(Connecting));
        assert!(!Complete.can_transition_to(Processing));
        assert!(Finalizing.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Idle.can_transition_to(Cancelled));
        assert!(Cancelled.can_transition_to(Idle));
        assert!(Complete.is_terminal());
        assert!(!Idle.is_terminal());
    }

    #[test]
    fn report_serializes_camel_case() {
        let mut report = SyncReport {
            success: true,
            duration_ms: 12,
            ..SyncReport::default()
        };
        report.record_error(Some(&meeting(1)), "disk full");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["durationMs"], 12);
        assert_eq!(value["errors"][0]["itemId"], "m-1");
        assert_eq!(value["errors"][0]["itemTitle"], "Meeting 1");
    }

    #[test]
    fn config_round_trips_with_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"queueCapacity": 3}"#).unwrap();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.batch.max_size, 50);
        assert_eq!(config.persist_debounce, Duration::from_secs(2));
    }
}
