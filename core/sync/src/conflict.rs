//! Conflict detection and resolution.
//!
//! Detection and resolution are both pure: detection classifies what happened to a
//! mirrored file since the last sync, and a [`ConflictPolicy`] decides what to do
//! about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use minutesync_common::{MirrorPath, RemoteId};

use crate::state::FileMetadata;

/// Classification of a remote item against local facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// Nothing diverged; the remote version may be written.
    None,
    /// The item is tracked but its file is gone.
    FileMissing,
    /// The file was edited after it was last written by a sync.
    UserModified,
}

/// A detected divergence. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub remote_id: RemoteId,
    pub local_path: Option<MirrorPath>,
    pub user_modified_time: Option<DateTime<Utc>>,
    pub remote_modified_time: DateTime<Utc>,
}

impl Conflict {
    pub fn is_conflict(&self) -> bool {
        self.kind != ConflictKind::None
    }
}

/// What is known about the local side of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFacts {
    pub exists: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl LocalFacts {
    pub fn missing() -> Self {
        Self {
            exists: false,
            modified: None,
        }
    }

    pub fn present(modified: DateTime<Utc>) -> Self {
        Self {
            exists: true,
            modified: Some(modified),
        }
    }
}

/// Classify a remote item.
///
/// Untracked items never conflict. A tracked item whose file is gone is
/// `FileMissing`; one whose file changed strictly after the last sync write is
/// `UserModified`.
pub fn detect_conflict(
    remote_id: &RemoteId,
    remote_modified: DateTime<Utc>,
    prior: Option<&FileMetadata>,
    local: LocalFacts,
) -> Conflict {
    let mut conflict = Conflict {
        kind: ConflictKind::None,
        remote_id: remote_id.clone(),
        local_path: prior.map(|m| m.path.clone()),
        user_modified_time: None,
        remote_modified_time: remote_modified,
    };

    let Some(prior) = prior else {
        return conflict;
    };

    if !local.exists {
        conflict.kind = ConflictKind::FileMissing;
        return conflict;
    }

    if let Some(mtime) = local.modified {
        if mtime > prior.last_synced {
            conflict.kind = ConflictKind::UserModified;
            conflict.user_modified_time = Some(mtime);
        }
    }
    conflict
}

/// How to proceed with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Write the remote version normally.
    Proceed,
    /// Leave the item alone this run.
    Skip,
    /// Preserve the local file; remote content is handled per merge boundary.
    KeepLocal,
    /// Overwrite the local file with the remote version.
    KeepRemote,
}

/// Decides what to do about a conflict.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Static mapping from conflict kind to resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionTable {
    pub file_missing: Resolution,
    pub user_modified: Resolution,
}

impl Default for ResolutionTable {
    fn default() -> Self {
        Self {
            file_missing: Resolution::Skip,
            user_modified: Resolution::KeepLocal,
        }
    }
}

impl ConflictPolicy for ResolutionTable {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        match conflict.kind {
            ConflictKind::None => Resolution::Proceed,
            ConflictKind::FileMissing => self.file_missing,
            ConflictKind::UserModified => self.user_modified,
        }
    }
}

/// Remote always wins; missing files are recreated.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysKeepRemote;

impl ConflictPolicy for AlwaysKeepRemote {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        match conflict.kind {
            ConflictKind::None => Resolution::Proceed,
            _ => Resolution::KeepRemote,
        }
    }
}
