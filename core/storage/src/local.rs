//! Local filesystem file store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::file_store::FileStore;
use minutesync_common::{Error, MirrorPath, Result};

/// File store backed by a directory on disk.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// The mirror root on disk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a MirrorPath to a filesystem path.
    pub fn to_fs_path(&self, path: &MirrorPath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    /// Convert a filesystem path under the root back to a MirrorPath.
    ///
    /// Returns `None` for paths outside the root or that are not valid UTF-8.
    pub fn from_fs_path(root: &Path, fs_path: &Path) -> Option<MirrorPath> {
        let relative = fs_path.strip_prefix(root).ok()?;
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_str().map(String::from))
            .collect::<Option<Vec<_>>>()?;
        if components.is_empty() {
            return None;
        }
        MirrorPath::from_components(components).ok()
    }

    fn temp_path_for(fs_path: &Path) -> PathBuf {
        let name = fs_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        fs_path.with_file_name(format!(".{}.tmp", name))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn exists(&self, path: &MirrorPath) -> Result<bool> {
        let fs_path = self.to_fs_path(path);
        Ok(fs::try_exists(&fs_path).await? && !fs_path.is_dir())
    }

    async fn read(&self, path: &MirrorPath) -> Result<String> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput("Cannot read a directory".to_string()));
        }

        Ok(fs::read_to_string(&fs_path).await?)
    }

    async fn write(&self, path: &MirrorPath, content: &str) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot write to the mirror root".to_string()));
        }
        let fs_path = self.to_fs_path(path);

        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = Self::temp_path_for(&fs_path);
        fs::write(&tmp, content.as_bytes()).await?;
        if let Err(e) = fs::rename(&tmp, &fs_path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Storage(format!("Failed to write {}: {}", path, e)));
        }

        debug!("Wrote {} ({} bytes)", path, content.len());
        Ok(())
    }

    async fn rename(&self, from: &MirrorPath, to: &MirrorPath) -> Result<()> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !from_path.exists() {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if to_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn delete(&self, path: &MirrorPath) -> Result<()> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(
                "Refusing to delete a directory".to_string(),
            ));
        }

        fs::remove_file(&fs_path).await?;
        Ok(())
    }

    async fn modified(&self, path: &MirrorPath) -> Result<Option<DateTime<Utc>>> {
        let fs_path = self.to_fs_path(path);

        match fs::metadata(&fs_path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.modified()?.into())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list_files(&self) -> Result<Vec<MirrorPath>> {
        let mut results = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_str().map(|n| n.starts_with('.')).unwrap_or(true) {
                    continue;
                }

                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    if let Some(path) = Self::from_fs_path(&self.root, &entry.path()) {
                        results.push(path);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }
}
