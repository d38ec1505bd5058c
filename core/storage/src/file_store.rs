//! Local file store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use minutesync_common::{MirrorPath, Result};

/// A change observed in the local mirror that did not originate from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// File content or metadata changed (or a file appeared).
    Modified(MirrorPath),
    /// File was removed.
    Deleted(MirrorPath),
    /// File moved within the mirror.
    Renamed { from: MirrorPath, to: MirrorPath },
}

impl FileEvent {
    /// The path the event leaves behind (destination for renames).
    pub fn path(&self) -> &MirrorPath {
        match self {
            FileEvent::Modified(p) | FileEvent::Deleted(p) => p,
            FileEvent::Renamed { to, .. } => to,
        }
    }
}

/// Storage for the mirrored documents.
///
/// Paths are relative to the mirror root. Hidden paths (any component starting
/// with '.') belong to the engine and are never listed.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Check if a file exists.
    async fn exists(&self, path: &MirrorPath) -> Result<bool>;

    /// Read a file as UTF-8 text.
    ///
    /// # Errors
    /// - File not found
    async fn read(&self, path: &MirrorPath) -> Result<String>;

    /// Write a file, creating parent directories as needed.
    ///
    /// # Postconditions
    /// - The file holds exactly `content`; a partially written file is never observable
    async fn write(&self, path: &MirrorPath, content: &str) -> Result<()>;

    /// Move a file.
    ///
    /// # Errors
    /// - Source not found
    /// - Destination already exists
    async fn rename(&self, from: &MirrorPath, to: &MirrorPath) -> Result<()>;

    /// Delete a file.
    async fn delete(&self, path: &MirrorPath) -> Result<()>;

    /// Last modification time, or `None` if the file does not exist.
    async fn modified(&self, path: &MirrorPath) -> Result<Option<DateTime<Utc>>>;

    /// All non-hidden files under the mirror root.
    async fn list_files(&self) -> Result<Vec<MirrorPath>>;
}
