//! Sync state tracking: the persisted document and transaction records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use minutesync_common::{digest_hex, Error, MirrorPath, RemoteId, Result};

/// Current schema version of the persisted state document.
pub const CURRENT_VERSION: u32 = 3;

/// Metadata for one synchronized remote item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Remote identifier; always equal to the key this entry is stored under.
    pub remote_id: RemoteId,
    /// Current local location.
    pub path: MirrorPath,
    /// Digest of the synchronized body, frontmatter excluded.
    pub content_hash: String,
    /// Local modification time at last observation.
    pub last_modified: DateTime<Utc>,
    /// Time of the last successful write.
    pub last_synced: DateTime<Utc>,
    /// Incremented on every write.
    pub sync_version: u64,
}

/// Overall sync state for the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Schema version.
    pub version: u32,
    /// Tracked items by remote id.
    #[serde(default)]
    pub files: BTreeMap<RemoteId, FileMetadata>,
    /// Ids deleted locally that must not be recreated. Disjoint from `files`.
    #[serde(default)]
    pub deleted_ids: BTreeSet<RemoteId>,
    /// High-water mark for incremental listing.
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Digest over `files`, `deleted_ids` and `last_sync`.
    #[serde(default)]
    pub checksum: String,
}

/// The checksummed portion of the state, borrowed.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumView<'a> {
    files: &'a BTreeMap<RemoteId, FileMetadata>,
    deleted_ids: &'a BTreeSet<RemoteId>,
    last_sync: &'a Option<DateTime<Utc>>,
}

impl SyncState {
    /// Create a new empty sync state at the current version.
    pub fn new() -> Self {
        let mut state = Self {
            version: CURRENT_VERSION,
            files: BTreeMap::new(),
            deleted_ids: BTreeSet::new(),
            last_sync: None,
            checksum: String::new(),
        };
        state.seal();
        state
    }

    /// Compute the integrity digest over the checksummed fields.
    ///
    /// Ordered containers make the serialization, and so the digest, deterministic.
    pub fn compute_checksum(&self) -> String {
        let view = ChecksumView {
            files: &self.files,
            deleted_ids: &self.deleted_ids,
            last_sync: &self.last_sync,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        digest_hex(&bytes)
    }

    /// Refresh the stored checksum.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Whether the stored checksum matches the content.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Repair structural invariants after loading.
    ///
    /// Entry ids are forced to match their keys and tombstones for tracked ids are
    /// dropped. Returns the number of repairs made.
    pub fn normalize(&mut self) -> usize {
        let mut repairs = 0;
        for (key, meta) in self.files.iter_mut() {
            if &meta.remote_id != key {
                meta.remote_id = key.clone();
                repairs += 1;
            }
        }
        let before = self.deleted_ids.len();
        let files = &self.files;
        self.deleted_ids.retain(|id| !files.contains_key(id));
        repairs + (before - self.deleted_ids.len())
    }

    /// Get metadata for an item.
    pub fn get(&self, id: &RemoteId) -> Option<&FileMetadata> {
        self.files.get(id)
    }

    /// Whether the item is tombstoned.
    pub fn is_deleted(&self, id: &RemoteId) -> bool {
        self.deleted_ids.contains(id)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of a logged state mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

/// One mutation recorded inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OperationKind,
    pub remote_id: RemoteId,
    /// Resulting metadata; `None` for deletions.
    pub metadata: Option<FileMetadata>,
}

/// An open transaction: the operation log plus the state as it was at begin.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operations: Vec<Operation>,
    pub snapshot: SyncState,
}

impl Transaction {
    /// Begin a transaction over `snapshot`.
    pub fn begin(id: impl Into<String>, snapshot: SyncState) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            operations: Vec::new(),
            snapshot,
        }
    }

    /// Append an operation to the log.
    pub fn record(&mut self, kind: OperationKind, remote_id: RemoteId, metadata: Option<FileMetadata>) {
        self.operations.push(Operation {
            kind,
            remote_id,
            metadata,
        });
    }

    /// Whether any mutation was recorded.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id(s: &str) -> RemoteId {
        RemoteId::new(s).unwrap()
    }

    fn meta(remote_id: &str, path: &str) -> FileMetadata {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        FileMetadata {
            remote_id: id(remote_id),
            path: MirrorPath::parse(path).unwrap(),
            content_hash: "h".to_string(),
            last_modified: at,
            last_synced: at,
            sync_version: 1,
        }
    }

    #[test]
    fn test_new_state_is_sealed() {
        let state = SyncState::new();
        assert_eq!(state.version, CURRENT_VERSION);
        assert!(state.verify_checksum());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut state = SyncState::new();
        state.files.insert(id("a"), meta("a", "a.md"));
        state.seal();
        assert!(state.verify_checksum());

        state.deleted_ids.insert(id("b"));
        assert!(!state.verify_checksum());
    }

    #[test]
    fn test_checksum_ignores_version_field() {
        let mut state = SyncState::new();
        let before = state.compute_checksum();
        state.version = 99;
        assert_eq!(before, state.compute_checksum());
    }

    #[test]
    fn test_deleted_ids_persist_as_array() {
        let mut state = SyncState::new();
        state.deleted_ids.insert(id("z"));
        state.deleted_ids.insert(id("x"));
        state.seal();

        let value: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
        assert_eq!(value["deletedIds"], serde_json::json!(["x", "z"]));

        let restored = SyncState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored, state);
        assert!(restored.verify_checksum());
    }

    #[test]
    fn test_duplicate_tombstones_collapse_on_load() {
        let json = r#"{"version":3,"files":{},"deletedIds":["x","x"],"lastSync":null,"checksum":""}"#;
        let state = SyncState::from_json(json).unwrap();
        assert_eq!(state.deleted_ids.len(), 1);
    }

    #[test]
    fn test_normalize_repairs_invariants() {
        let mut state = SyncState::new();
        state.files.insert(id("a"), meta("wrong", "a.md"));
        state.deleted_ids.insert(id("a"));
        state.deleted_ids.insert(id("b"));

        assert_eq!(state.normalize(), 2);
        assert_eq!(state.files[&id("a")].remote_id, id("a"));
        assert!(!state.is_deleted(&id("a")));
        assert!(state.is_deleted(&id("b")));
    }

    #[test]
    fn test_transaction_log() {
        let mut tx = Transaction::begin("tx-1", SyncState::new());
        assert!(tx.is_empty());
        tx.record(OperationKind::Add, id("a"), Some(meta("a", "a.md")));
        tx.record(OperationKind::Delete, id("b"), None);
        assert_eq!(tx.operations.len(), 2);
        assert_eq!(tx.operations[1].kind, OperationKind::Delete);
    }
}
