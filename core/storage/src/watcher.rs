//! Change notifications for the local mirror.

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::file_store::FileEvent;
use crate::local::LocalFileStore;
use minutesync_common::{Error, Result};

/// Watches the mirror root and forwards changes as [`FileEvent`]s.
///
/// Events for hidden paths (including the state directory) are dropped. The
/// watcher stops when this value is dropped.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: impl AsRef<Path>) -> Result<(Self, mpsc::UnboundedReceiver<FileEvent>)> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| Error::Storage(format!("Cannot watch mirror root: {}", e)))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let callback_root = root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Some(file_event) = convert_event(&callback_root, event) {
                        if event_tx.send(file_event).is_err() {
                            debug!("File event receiver dropped");
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| Error::Storage(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Storage(format!("Failed to watch {}: {}", root.display(), e)))?;

        debug!("Watching {}", root.display());
        Ok((
            Self {
                _watcher: watcher,
                root,
            },
            event_rx,
        ))
    }

    /// The canonical root being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Translate a raw notification into a mirror event.
fn convert_event(root: &Path, event: Event) -> Option<FileEvent> {
    let to_mirror = |p: &PathBuf| {
        LocalFileStore::from_fs_path(root, p).filter(|path| !path.is_hidden())
    };

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let from = to_mirror(&event.paths[0]);
            let to = to_mirror(&event.paths[1]);
            match (from, to) {
                (Some(from), Some(to)) => Some(FileEvent::Renamed { from, to }),
                // Moved out of view: treat as a deletion.
                (Some(from), None) => Some(FileEvent::Deleted(from)),
                (None, Some(to)) => Some(FileEvent::Modified(to)),
                (None, None) => None,
            }
        }
        // Halves of a rename are reported again as `Both` once paired.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => None,
        EventKind::Remove(_) => event.paths.first().and_then(to_mirror).map(FileEvent::Deleted),
        EventKind::Create(_) | EventKind::Modify(_) => {
            event.paths.first().and_then(to_mirror).map(FileEvent::Modified)
        }
        _ => None,
    }
}
