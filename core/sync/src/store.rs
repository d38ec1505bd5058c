//! Persistent sync state with transactional snapshots and self-repair.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use minutesync_common::{content_hash, frontmatter_field, Error, MirrorPath, RemoteId, Result};
use minutesync_storage::{FileEvent, FileStore};

use crate::migrate::{document_version, migrate};
use crate::state::{FileMetadata, OperationKind, SyncState, Transaction, CURRENT_VERSION};

/// Hidden directory under the mirror root that holds engine state.
pub const STATE_DIR_NAME: &str = ".minutesync";
/// Primary state document.
pub const STATE_FILE_NAME: &str = "state.json";
/// Backup ring document.
pub const BACKUP_FILE_NAME: &str = "state.backups.json";
/// Number of pre-transaction snapshots retained.
pub const BACKUP_CAPACITY: usize = 5;
/// Frontmatter key that ties a mirrored file to its remote item.
pub const DEFAULT_FRONTMATTER_KEY: &str = "remote_id";

/// State directory for a mirror rooted at `mirror_root`.
pub fn state_dir_for(mirror_root: impl AsRef<Path>) -> PathBuf {
    mirror_root.as_ref().join(STATE_DIR_NAME)
}

/// How `initialize` obtained the working state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// No state existed; an empty one was created.
    Created,
    /// The persisted state was valid.
    Loaded,
    /// The persisted state was upgraded from an older schema.
    Migrated { from: u32 },
    /// The persisted state was unusable; the newest valid backup was restored.
    RestoredFromBackup,
    /// Neither state nor backups were usable; the mirror was rescanned.
    Rebuilt { recovered: usize },
}

/// Read-only summary of a persisted state directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateInspection {
    pub exists: bool,
    pub version: Option<u32>,
    pub checksum_valid: bool,
    pub needs_migration: bool,
    pub files: usize,
    pub tombstones: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub backups: usize,
    pub valid_backups: usize,
    pub problem: Option<String>,
}

/// Owner of the sync state.
///
/// All mutation of `FileMetadata` goes through this type. Mutations made while a
/// transaction is open are logged and can be rolled back as a unit.
pub struct StateStore {
    state: SyncState,
    files: Arc<dyn FileStore>,
    state_dir: PathBuf,
    path_index: HashMap<MirrorPath, RemoteId>,
    transaction: Option<Transaction>,
    backups: VecDeque<SyncState>,
    deferred_events: Vec<FileEvent>,
    frontmatter_key: String,
    dirty: bool,
}

impl StateStore {
    /// Create a store over `files`, persisting into `state_dir`.
    ///
    /// Nothing is read until [`StateStore::initialize`] is called.
    pub fn new(files: Arc<dyn FileStore>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: SyncState::new(),
            files,
            state_dir: state_dir.into(),
            path_index: HashMap::new(),
            transaction: None,
            backups: VecDeque::with_capacity(BACKUP_CAPACITY),
            deferred_events: Vec::new(),
            frontmatter_key: DEFAULT_FRONTMATTER_KEY.to_string(),
            dirty: false,
        }
    }

    /// Use a different frontmatter key for ownership and rescans.
    pub fn with_frontmatter_key(mut self, key: impl Into<String>) -> Self {
        self.frontmatter_key = key.into();
        self
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir.join(BACKUP_FILE_NAME)
    }

    /// Load persisted state, migrating or recovering as needed.
    ///
    /// Never fails: unreadable or corrupt state is recovered from backups or by
    /// rescanning the mirror.
    pub async fn initialize(&mut self) -> InitOutcome {
        self.transaction = None;
        self.deferred_events.clear();
        self.dirty = false;
        self.backups = load_backups(&self.backup_path()).await;

        let outcome = match self.load_primary().await {
            Ok(None) => {
                info!("No sync state found, starting fresh");
                self.state = SyncState::new();
                self.dirty = true;
                InitOutcome::Created
            }
            Ok(Some((state, from))) => {
                self.state = state;
                if from < CURRENT_VERSION {
                    self.dirty = true;
                    InitOutcome::Migrated { from }
                } else {
                    InitOutcome::Loaded
                }
            }
            Err(e) => {
                warn!("Sync state unusable ({}), recovering", e);
                self.recover().await
            }
        };

        let repairs = self.state.normalize();
        if repairs > 0 {
            warn!("Repaired {} inconsistencies in sync state", repairs);
            self.dirty = true;
        }
        self.rebuild_index();

        if self.dirty {
            if let Err(e) = self.persist().await {
                error!("Failed to persist initialized sync state: {}", e);
            }
        }

        info!(
            "Sync state ready: {} files, {} tombstones ({:?})",
            self.state.files.len(),
            self.state.deleted_ids.len(),
            outcome
        );
        outcome
    }

    /// Read, migrate and validate the primary document.
    ///
    /// Returns `None` when no document exists, otherwise the state and the version
    /// it was stored at.
    async fn load_primary(&self) -> Result<Option<(SyncState, u32)>> {
        let raw = match tokio::fs::read_to_string(self.state_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut doc: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::StateCorruption(format!("unparseable state: {}", e)))?;
        let from = migrate(&mut doc)?;
        let mut state: SyncState = serde_json::from_value(doc)
            .map_err(|e| Error::StateCorruption(format!("malformed state: {}", e)))?;

        if from == CURRENT_VERSION {
            if !state.verify_checksum() {
                return Err(Error::StateCorruption("checksum mismatch".to_string()));
            }
        } else {
            state.version = CURRENT_VERSION;
            state.seal();
        }

        Ok(Some((state, from)))
    }

    async fn recover(&mut self) -> InitOutcome {
        if let Some(backup) = self.backups.iter().rev().find(|b| b.verify_checksum()) {
            info!("Restored sync state from backup");
            self.state = backup.clone();
            self.dirty = true;
            return InitOutcome::RestoredFromBackup;
        }

        let salvaged = self.salvage_tombstones().await;
        let recovered = match self.rescan().await {
            Ok(files) => files,
            Err(e) => {
                error!("Mirror rescan failed: {}", e);
                Default::default()
            }
        };

        let mut state = SyncState::new();
        state.deleted_ids = salvaged
            .into_iter()
            .filter(|id| !recovered.contains_key(id))
            .collect();
        state.files = recovered;
        state.seal();

        let count = state.files.len();
        info!("Rebuilt sync state from {} mirrored files", count);
        self.state = state;
        self.dirty = true;
        InitOutcome::Rebuilt { recovered: count }
    }

    /// Tombstones readable from a damaged primary document, if any.
    async fn salvage_tombstones(&self) -> BTreeSet<RemoteId> {
        let Ok(raw) = tokio::fs::read_to_string(self.state_path()).await else {
            return BTreeSet::new();
        };
        let Ok(doc) = serde_json::from_str::<Value>(&raw) else {
            return BTreeSet::new();
        };
        doc.get("deletedIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| RemoteId::new(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuild file entries from mirrored documents that still carry their remote id.
    async fn rescan(&self) -> Result<std::collections::BTreeMap<RemoteId, FileMetadata>> {
        let mut paths = self.files.list_files().await?;
        paths.sort();

        let mut found = std::collections::BTreeMap::new();
        for path in paths {
            let text = match self.files.read(&path).await {
                Ok(text) => text,
                Err(e) => {
                    debug!("Skipping unreadable file {} during rescan: {}", path, e);
                    continue;
                }
            };
            let Some(id) = frontmatter_field(&text, &self.frontmatter_key)
                .and_then(|raw| RemoteId::new(raw).ok())
            else {
                continue;
            };
            if found.contains_key(&id) {
                warn!("Duplicate remote id {} at {}, keeping first", id, path);
                continue;
            }

            let mtime = self.files.modified(&path).await?.unwrap_or_else(Utc::now);
            found.insert(
                id.clone(),
                FileMetadata {
                    remote_id: id,
                    path,
                    content_hash: content_hash(&text),
                    last_modified: mtime,
                    last_synced: mtime,
                    sync_version: 1,
                },
            );
        }
        Ok(found)
    }

    fn rebuild_index(&mut self) {
        self.path_index = self
            .state
            .files
            .iter()
            .map(|(id, meta)| (meta.path.clone(), id.clone()))
            .collect();
    }

    /// Open a transaction.
    ///
    /// # Errors
    /// - `TransactionConflict` if a transaction is already open
    pub fn begin_transaction(&mut self, id: impl Into<String>) -> Result<()> {
        if let Some(open) = &self.transaction {
            return Err(Error::TransactionConflict(format!(
                "transaction {} is already open",
                open.id
            )));
        }
        let mut snapshot = self.state.clone();
        snapshot.seal();
        let tx = Transaction::begin(id, snapshot);
        debug!("Began transaction {}", tx.id);
        self.transaction = Some(tx);
        Ok(())
    }

    /// Record the outcome of a write for `remote_id`.
    ///
    /// # Preconditions
    /// - `path` exists in the file store
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `AlreadyExists` if another item owns `path`
    pub async fn add_or_update(
        &mut self,
        remote_id: &RemoteId,
        path: &MirrorPath,
        content_hash: impl Into<String>,
        sync_version: u64,
    ) -> Result<FileMetadata> {
        let mtime = self
            .files
            .modified(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))?;

        if let Some(owner) = self.path_index.get(path) {
            if owner != remote_id {
                return Err(Error::AlreadyExists(format!(
                    "{} is tracked for {}",
                    path, owner
                )));
            }
        }

        let kind = match self.state.files.get(remote_id) {
            Some(prior) => {
                if &prior.path != path {
                    self.path_index.remove(&prior.path);
                }
                OperationKind::Update
            }
            None => OperationKind::Add,
        };

        let meta = FileMetadata {
            remote_id: remote_id.clone(),
            path: path.clone(),
            content_hash: content_hash.into(),
            last_modified: mtime,
            last_synced: Utc::now().max(mtime),
            sync_version,
        };

        self.state.files.insert(remote_id.clone(), meta.clone());
        self.state.deleted_ids.remove(remote_id);
        self.path_index.insert(path.clone(), remote_id.clone());
        if let Some(tx) = self.transaction.as_mut() {
            tx.record(kind, remote_id.clone(), Some(meta.clone()));
        }
        self.dirty = true;
        Ok(meta)
    }

    /// Stop tracking `remote_id` and tombstone it.
    ///
    /// Returns whether the item was tracked.
    pub fn mark_deleted(&mut self, remote_id: &RemoteId) -> bool {
        let removed = self.state.files.remove(remote_id);
        if let Some(meta) = &removed {
            self.path_index.remove(&meta.path);
        }
        self.state.deleted_ids.insert(remote_id.clone());
        if let Some(tx) = self.transaction.as_mut() {
            tx.record(OperationKind::Delete, remote_id.clone(), None);
        }
        self.dirty = true;
        removed.is_some()
    }

    /// Remove a tombstone so the item can be synced again.
    pub fn clear_tombstone(&mut self, remote_id: &RemoteId) -> bool {
        let cleared = self.state.deleted_ids.remove(remote_id);
        if cleared {
            self.dirty = true;
        }
        cleared
    }

    /// Advance the incremental high-water mark.
    pub fn set_last_sync(&mut self, at: DateTime<Utc>) {
        self.state.last_sync = Some(at);
        self.dirty = true;
    }

    /// Close the open transaction, keeping its changes.
    ///
    /// A transaction that recorded operations pushes its snapshot onto the backup
    /// ring. State is persisted when anything changed.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| Error::TransactionConflict("no transaction is open".to_string()))?;

        if !tx.is_empty() {
            self.backups.push_back(tx.snapshot);
            while self.backups.len() > BACKUP_CAPACITY {
                self.backups.pop_front();
            }
        }

        self.drain_deferred().await;
        if self.dirty {
            self.persist().await?;
        }
        info!(
            "Committed transaction {} ({} operations)",
            tx.id,
            tx.operations.len()
        );
        Ok(())
    }

    /// Close the open transaction, restoring the state captured at begin.
    pub async fn rollback_transaction(&mut self) -> Result<()> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| Error::TransactionConflict("no transaction is open".to_string()))?;

        info!(
            "Rolling back transaction {} ({} operations)",
            tx.id,
            tx.operations.len()
        );
        self.state = tx.snapshot;
        self.rebuild_index();
        if self.drain_deferred().await {
            self.persist().await?;
        }
        Ok(())
    }

    /// Drop entries whose files no longer exist. Entries are not tombstoned.
    pub async fn cleanup_orphans(&mut self) -> Result<usize> {
        let mut orphans = Vec::new();
        for (id, meta) in &self.state.files {
            if !self.files.exists(&meta.path).await? {
                orphans.push(id.clone());
            }
        }

        for id in &orphans {
            if let Some(meta) = self.state.files.remove(id) {
                debug!("Removing orphaned entry {} ({})", id, meta.path);
                self.path_index.remove(&meta.path);
            }
            if let Some(tx) = self.transaction.as_mut() {
                tx.record(OperationKind::Delete, id.clone(), None);
            }
        }
        if !orphans.is_empty() {
            self.dirty = true;
            info!("Removed {} orphaned entries", orphans.len());
        }
        Ok(orphans.len())
    }

    /// Apply a local file change.
    ///
    /// Events arriving during a transaction are held until it closes. Returns
    /// whether the state changed.
    pub async fn apply_event(&mut self, event: FileEvent) -> Result<bool> {
        if self.transaction.is_some() {
            debug!("Deferring file event during transaction: {:?}", event);
            self.deferred_events.push(event);
            return Ok(false);
        }
        self.apply_event_now(event).await
    }

    /// Apply events held during a transaction. Returns whether any changed state.
    async fn drain_deferred(&mut self) -> bool {
        let events = std::mem::take(&mut self.deferred_events);
        let mut changed = false;
        for event in events {
            match self.apply_event_now(event).await {
                Ok(applied) => changed |= applied,
                Err(e) => warn!("Failed to apply deferred file event: {}", e),
            }
        }
        changed
    }

    async fn apply_event_now(&mut self, event: FileEvent) -> Result<bool> {
        match event {
            FileEvent::Renamed { from, to } => {
                let Some(id) = self.path_index.remove(&from) else {
                    return Ok(false);
                };
                // The file that was at `to` is gone; its owner counts as deleted.
                if let Some(displaced) = self.path_index.get(&to).cloned() {
                    warn!("{} replaced the tracked file of {}, tombstoning it", from, displaced);
                    self.mark_deleted(&displaced);
                }
                let mtime = self.files.modified(&to).await?;
                if let Some(meta) = self.state.files.get_mut(&id) {
                    debug!("Tracked file for {} moved: {} -> {}", id, from, to);
                    meta.path = to.clone();
                    if let Some(mtime) = mtime {
                        meta.last_modified = mtime;
                    }
                }
                self.path_index.insert(to, id);
                self.dirty = true;
                Ok(true)
            }
            FileEvent::Deleted(path) => {
                let Some(id) = self.path_index.get(&path).cloned() else {
                    return Ok(false);
                };
                if self.files.exists(&path).await? {
                    return Ok(false);
                }
                info!("Tracked file {} deleted locally, tombstoning {}", path, id);
                self.mark_deleted(&id);
                Ok(true)
            }
            FileEvent::Modified(path) => {
                let Some(id) = self.path_index.get(&path).cloned() else {
                    return Ok(false);
                };
                let Some(mtime) = self.files.modified(&path).await? else {
                    return Ok(false);
                };
                match self.state.files.get_mut(&id) {
                    Some(meta) if meta.last_modified != mtime => {
                        meta.last_modified = mtime;
                        self.dirty = true;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    /// Write state and backups to disk atomically.
    pub async fn persist(&mut self) -> Result<()> {
        self.state.version = CURRENT_VERSION;
        self.state.seal();

        tokio::fs::create_dir_all(&self.state_dir).await?;
        write_atomic(&self.state_path(), self.state.to_json()?.as_bytes()).await?;

        let backups: Vec<&SyncState> = self.backups.iter().collect();
        let json = serde_json::to_string_pretty(&backups)?;
        write_atomic(&self.backup_path(), json.as_bytes()).await?;

        self.dirty = false;
        debug!("Persisted sync state to {}", self.state_dir.display());
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Metadata for an item.
    pub fn get(&self, remote_id: &RemoteId) -> Option<&FileMetadata> {
        self.state.files.get(remote_id)
    }

    /// The item that owns `path`, if tracked.
    pub fn owner_of(&self, path: &MirrorPath) -> Option<&RemoteId> {
        self.path_index.get(path)
    }

    pub fn is_tombstoned(&self, remote_id: &RemoteId) -> bool {
        self.state.is_deleted(remote_id)
    }

    pub fn has_open_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Operations logged by the open transaction.
    pub fn pending_operations(&self) -> usize {
        self.transaction
            .as_ref()
            .map_or(0, |tx| tx.operations.len())
    }

    /// Whether there are unpersisted changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Retained pre-transaction snapshots, oldest first.
    pub fn backups(&self) -> &VecDeque<SyncState> {
        &self.backups
    }

    pub fn frontmatter_key(&self) -> &str {
        &self.frontmatter_key
    }

    pub fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    /// Summarize a state directory without modifying it.
    pub async fn inspect(state_dir: impl AsRef<Path>) -> Result<StateInspection> {
        let state_dir = state_dir.as_ref();
        let backups = load_backups(&state_dir.join(BACKUP_FILE_NAME)).await;
        let mut report = StateInspection {
            exists: false,
            version: None,
            checksum_valid: false,
            needs_migration: false,
            files: 0,
            tombstones: 0,
            last_sync: None,
            backups: backups.len(),
            valid_backups: backups.iter().filter(|b| b.verify_checksum()).count(),
            problem: None,
        };

        let raw = match tokio::fs::read_to_string(state_dir.join(STATE_FILE_NAME)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        report.exists = true;

        let mut doc: Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                report.problem = Some(format!("unparseable state: {}", e));
                return Ok(report);
            }
        };
        let version = match document_version(&doc) {
            Ok(v) => v,
            Err(e) => {
                report.problem = Some(e.to_string());
                return Ok(report);
            }
        };
        report.version = Some(version);
        report.needs_migration = version < CURRENT_VERSION;

        if let Err(e) = migrate(&mut doc) {
            report.problem = Some(e.to_string());
            return Ok(report);
        }
        match serde_json::from_value::<SyncState>(doc) {
            Ok(state) => {
                report.files = state.files.len();
                report.tombstones = state.deleted_ids.len();
                report.last_sync = state.last_sync;
                report.checksum_valid = !report.needs_migration && state.verify_checksum();
                if !report.needs_migration && !report.checksum_valid {
                    report.problem = Some("checksum mismatch".to_string());
                }
            }
            Err(e) => report.problem = Some(format!("malformed state: {}", e)),
        }
        Ok(report)
    }
}

async fn load_backups(path: &Path) -> VecDeque<SyncState> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read state backups: {}", e);
            }
            return VecDeque::new();
        }
    };
    match serde_json::from_str::<Vec<SyncState>>(&raw) {
        Ok(mut backups) => {
            let excess = backups.len().saturating_sub(BACKUP_CAPACITY);
            backups.drain(..excess);
            backups.into()
        }
        Err(e) => {
            warn!("Discarding unreadable state backups: {}", e);
            VecDeque::new()
        }
    }
}

/// Write via a temporary sibling and rename over the target.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minutesync_storage::LocalFileStore;
    use tempfile::TempDir;

    fn id(s: &str) -> RemoteId {
        RemoteId::new(s).unwrap()
    }

    fn path(s: &str) -> MirrorPath {
        MirrorPath::parse(s).unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        files: Arc<dyn FileStore>,
        state_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir.path()).unwrap());
            let state_dir = state_dir_for(dir.path());
            Self {
                _dir: dir,
                files,
                state_dir,
            }
        }

        fn store(&self) -> StateStore {
            StateStore::new(self.files.clone(), self.state_dir.clone())
        }

        async fn write(&self, p: &str, content: &str) {
            self.files.write(&path(p), content).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_initialize_creates_state() {
        let fx = Fixture::new();
        let mut store = fx.store();
        assert_eq!(store.initialize().await, InitOutcome::Created);
        assert!(fx.state_dir.join(STATE_FILE_NAME).exists());

        let mut reopened = fx.store();
        assert_eq!(reopened.initialize().await, InitOutcome::Loaded);
    }

    #[tokio::test]
    async fn test_add_or_update_requires_file() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;

        let result = store.add_or_update(&id("a"), &path("a.md"), "h", 1).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        fx.write("a.md", "body").await;
        let meta = store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();
        assert_eq!(meta.sync_version, 1);
        assert!(meta.last_synced >= meta.last_modified);
        assert_eq!(store.owner_of(&path("a.md")), Some(&id("a")));
    }

    #[tokio::test]
    async fn test_path_change_drops_stale_index() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;

        fx.write("old.md", "x").await;
        fx.write("new.md", "x").await;
        store.add_or_update(&id("a"), &path("old.md"), "h", 1).await.unwrap();
        store.add_or_update(&id("a"), &path("new.md"), "h", 2).await.unwrap();

        assert_eq!(store.owner_of(&path("old.md")), None);
        assert_eq!(store.owner_of(&path("new.md")), Some(&id("a")));

        let result = store.add_or_update(&id("b"), &path("new.md"), "h", 1).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_tombstones_stay_disjoint() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;

        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();
        assert!(store.mark_deleted(&id("a")));
        assert!(store.is_tombstoned(&id("a")));
        assert!(store.get(&id("a")).is_none());

        store.add_or_update(&id("a"), &path("a.md"), "h", 2).await.unwrap();
        assert!(!store.is_tombstoned(&id("a")));

        store.mark_deleted(&id("b"));
        assert!(store.clear_tombstone(&id("b")));
        assert!(!store.clear_tombstone(&id("b")));
    }

    #[tokio::test]
    async fn test_transaction_conflict() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;

        store.begin_transaction("t1").unwrap();
        assert!(matches!(
            store.begin_transaction("t2"),
            Err(Error::TransactionConflict(_))
        ));
        store.rollback_transaction().await.unwrap();
        assert!(store.commit_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;
        fx.write("b.md", "y").await;
        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();
        store.persist().await.unwrap();
        let before = store.state().clone();

        store.begin_transaction("t").unwrap();
        store.add_or_update(&id("b"), &path("b.md"), "h", 1).await.unwrap();
        store.mark_deleted(&id("a"));
        assert_eq!(store.pending_operations(), 2);
        store.rollback_transaction().await.unwrap();

        assert_eq!(store.state().files, before.files);
        assert_eq!(store.state().deleted_ids, before.deleted_ids);
        assert_eq!(store.owner_of(&path("a.md")), Some(&id("a")));
        assert_eq!(store.owner_of(&path("b.md")), None);
    }

    #[tokio::test]
    async fn test_backup_ring_is_bounded() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;

        for n in 0..(BACKUP_CAPACITY + 3) {
            let p = format!("{}.md", n);
            fx.write(&p, "x").await;
            store.begin_transaction(format!("t{}", n)).unwrap();
            store.add_or_update(&id(&n.to_string()), &path(&p), "h", 1).await.unwrap();
            store.commit_transaction().await.unwrap();
        }
        assert_eq!(store.backups().len(), BACKUP_CAPACITY);

        store.begin_transaction("empty").unwrap();
        store.commit_transaction().await.unwrap();
        assert_eq!(store.backups().len(), BACKUP_CAPACITY);
        assert_eq!(store.backups().back().unwrap().files.len(), BACKUP_CAPACITY + 2);
    }

    #[tokio::test]
    async fn test_corrupt_state_restores_from_backup() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;
        fx.write("b.md", "y").await;

        store.begin_transaction("t1").unwrap();
        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();
        store.commit_transaction().await.unwrap();
        store.begin_transaction("t2").unwrap();
        store.add_or_update(&id("b"), &path("b.md"), "h", 1).await.unwrap();
        store.commit_transaction().await.unwrap();

        let state_file = fx.state_dir.join(STATE_FILE_NAME);
        let tampered = std::fs::read_to_string(&state_file)
            .unwrap()
            .replace("\"syncVersion\": 1", "\"syncVersion\": 7");
        std::fs::write(&state_file, tampered).unwrap();

        let mut reopened = fx.store();
        assert_eq!(reopened.initialize().await, InitOutcome::RestoredFromBackup);
        // Newest backup is the snapshot taken before t2.
        assert!(reopened.get(&id("a")).is_some());
        assert!(reopened.get(&id("b")).is_none());
    }

    #[tokio::test]
    async fn test_unparseable_state_rebuilds_from_frontmatter() {
        let fx = Fixture::new();
        fx.write("Meetings/one.md", "---\nremote_id: m-1\n---\nbody\n").await;
        fx.write("Meetings/two.md", "---\nremote_id: m-2\n---\nbody\n").await;
        fx.write("Meetings/copy.md", "---\nremote_id: m-2\n---\nother\n").await;
        fx.write("notes.md", "no frontmatter here\n").await;

        std::fs::create_dir_all(&fx.state_dir).unwrap();
        std::fs::write(
            fx.state_dir.join(STATE_FILE_NAME),
            r#"{"version":3,"deletedIds":["m-1","gone"],"files":"#,
        )
        .unwrap();

        let mut store = fx.store();
        assert_eq!(store.initialize().await, InitOutcome::Rebuilt { recovered: 2 });

        // "copy.md" sorts before "two.md", so it wins the duplicate.
        assert_eq!(store.get(&id("m-2")).unwrap().path, path("Meetings/copy.md"));
        assert_eq!(store.get(&id("m-1")).unwrap().sync_version, 1);
        assert!(store.state().last_sync.is_none());
        // Unparseable documents yield no salvageable tombstones.
        assert!(!store.is_tombstoned(&id("gone")));
    }

    #[tokio::test]
    async fn test_checksum_failure_salvages_disjoint_tombstones() {
        let fx = Fixture::new();
        fx.write("one.md", "---\nremote_id: m-1\n---\nbody\n").await;

        std::fs::create_dir_all(&fx.state_dir).unwrap();
        std::fs::write(
            fx.state_dir.join(STATE_FILE_NAME),
            r#"{"version":3,"files":{},"deletedIds":["m-1","gone"],"lastSync":null,"checksum":"bogus"}"#,
        )
        .unwrap();

        let mut store = fx.store();
        assert_eq!(store.initialize().await, InitOutcome::Rebuilt { recovered: 1 });
        assert!(store.is_tombstoned(&id("gone")));
        assert!(!store.is_tombstoned(&id("m-1")));
        assert!(store.get(&id("m-1")).is_some());
    }

    #[tokio::test]
    async fn test_v1_state_is_migrated_and_sealed() {
        let fx = Fixture::new();
        std::fs::create_dir_all(&fx.state_dir).unwrap();
        std::fs::write(
            fx.state_dir.join(STATE_FILE_NAME),
            r#"{"files":{"m-1":{"path":"a.md","contentHash":"h","lastModified":"2024-01-15T09:00:00Z"}},"lastSync":"2024-01-15T10:00:00Z"}"#,
        )
        .unwrap();

        let mut store = fx.store();
        assert_eq!(store.initialize().await, InitOutcome::Migrated { from: 1 });
        assert_eq!(store.get(&id("m-1")).unwrap().path, path("a.md"));

        let report = StateStore::inspect(&fx.state_dir).await.unwrap();
        assert_eq!(report.version, Some(CURRENT_VERSION));
        assert!(report.checksum_valid);
        assert_eq!(report.files, 1);
    }

    #[tokio::test]
    async fn test_cleanup_orphans() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;
        fx.write("b.md", "y").await;
        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();
        store.add_or_update(&id("b"), &path("b.md"), "h", 1).await.unwrap();

        fx.files.delete(&path("b.md")).await.unwrap();
        assert_eq!(store.cleanup_orphans().await.unwrap(), 1);
        assert!(store.get(&id("b")).is_none());
        assert!(!store.is_tombstoned(&id("b")));
    }

    #[tokio::test]
    async fn test_events_are_deferred_during_transaction() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;
        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();

        store.begin_transaction("t").unwrap();
        fx.files.rename(&path("a.md"), &path("moved.md")).await.unwrap();
        let applied = store
            .apply_event(FileEvent::Renamed {
                from: path("a.md"),
                to: path("moved.md"),
            })
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get(&id("a")).unwrap().path, path("a.md"));

        store.commit_transaction().await.unwrap();
        assert_eq!(store.get(&id("a")).unwrap().path, path("moved.md"));
        assert_eq!(store.owner_of(&path("moved.md")), Some(&id("a")));
    }

    #[tokio::test]
    async fn test_delete_event_tombstones() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;
        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();

        fx.files.delete(&path("a.md")).await.unwrap();
        assert!(store.apply_event(FileEvent::Deleted(path("a.md"))).await.unwrap());
        assert!(store.is_tombstoned(&id("a")));
        assert!(!store.apply_event(FileEvent::Deleted(path("a.md"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_onto_tracked_path_tombstones_displaced() {
        let fx = Fixture::new();
        let mut store = fx.store();
        store.initialize().await;
        fx.write("a.md", "x").await;
        fx.write("b.md", "y").await;
        store.add_or_update(&id("a"), &path("a.md"), "h", 1).await.unwrap();
        store.add_or_update(&id("b"), &path("b.md"), "h", 1).await.unwrap();

        // An editor saving over b.md: the old file is replaced in one rename.
        fx.files.delete(&path("b.md")).await.unwrap();
        fx.files.rename(&path("a.md"), &path("b.md")).await.unwrap();
        let applied = store
            .apply_event(FileEvent::Renamed {
                from: path("a.md"),
                to: path("b.md"),
            })
            .await
            .unwrap();
        assert!(applied);

        assert_eq!(store.get(&id("a")).unwrap().path, path("b.md"));
        assert_eq!(store.owner_of(&path("b.md")), Some(&id("a")));
        assert!(store.get(&id("b")).is_none());
        assert!(store.is_tombstoned(&id("b")));
        assert!(store.owner_of(&path("a.md")).is_none());
        let claiming_b = store
            .state()
            .files
            .values()
            .filter(|meta| meta.path == path("b.md"))
            .count();
        assert_eq!(claiming_b, 1);
    }
}
