//! Writing rendered items into the mirror.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use minutesync_common::{
    content_hash, frontmatter_field, split_frontmatter, Error, MirrorPath, RemoteId, Result,
};
use minutesync_storage::{FileStore, Item, SecondaryResource};

use crate::conflict::Resolution;
use crate::render::{ContentRenderer, PathGenerator};
use crate::state::FileMetadata;
use crate::store::StateStore;

/// Collision suffixes tried before giving up on a path.
const MAX_COUNTER: u32 = 1000;

/// What happens to remote content when the local file is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeBoundary {
    /// Append the remote body under a dated heading.
    #[default]
    AppendToEnd,
    /// Leave the local file exactly as it is.
    LeaveUntouched,
}

/// What the writer did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Created,
    Updated,
    /// Content matched the last sync; nothing was written.
    Unchanged,
    /// The local file was kept.
    MergedIntoLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub action: WriteAction,
    pub path: MirrorPath,
    /// Digest of the remote rendering, recorded as the synchronized content.
    pub content_hash: String,
}

/// Renders items and places them in the mirror.
pub struct DocumentWriter {
    files: Arc<dyn FileStore>,
    renderer: Arc<dyn ContentRenderer>,
    paths: Arc<dyn PathGenerator>,
    merge: MergeBoundary,
    frontmatter_key: String,
}

impl DocumentWriter {
    pub fn new(
        files: Arc<dyn FileStore>,
        renderer: Arc<dyn ContentRenderer>,
        paths: Arc<dyn PathGenerator>,
        merge: MergeBoundary,
        frontmatter_key: impl Into<String>,
    ) -> Self {
        Self {
            files,
            renderer,
            paths,
            merge,
            frontmatter_key: frontmatter_key.into(),
        }
    }

    /// Apply `resolution` for `item`.
    ///
    /// `store` is consulted for ownership only; recording the outcome is the
    /// caller's job.
    ///
    /// # Errors
    /// - `ConflictResolution` if the local file must be kept but is gone
    /// - `InvalidInput` for `Skip`, which has nothing to write
    /// - Storage errors from the file store
    pub async fn write(
        &self,
        store: &StateStore,
        item: &Item,
        secondaries: &[SecondaryResource],
        resolution: Resolution,
    ) -> Result<WriteOutcome> {
        let rendered = self.renderer.render(item, secondaries);
        let hash = content_hash(&rendered);
        let prior = store.get(&item.id);

        match resolution {
            Resolution::Skip => Err(Error::InvalidInput(format!(
                "{} is skipped; nothing to write",
                item.id
            ))),
            Resolution::KeepLocal => self.keep_local(item, prior, &rendered, hash).await,
            Resolution::Proceed | Resolution::KeepRemote => {
                let overwrite = resolution == Resolution::KeepRemote;
                let present = match prior {
                    Some(prior) => self.files.exists(&prior.path).await?,
                    None => false,
                };
                let existing = prior.filter(|_| present);
                match existing {
                    Some(prior) => {
                        self.update_existing(store, item, prior, rendered, hash, overwrite)
                            .await
                    }
                    None => self.place_new(store, item, prior.is_some(), rendered, hash).await,
                }
            }
        }
    }

    async fn keep_local(
        &self,
        item: &Item,
        prior: Option<&FileMetadata>,
        rendered: &str,
        hash: String,
    ) -> Result<WriteOutcome> {
        let present = match prior {
            Some(prior) => self.files.exists(&prior.path).await?,
            None => false,
        };
        let prior = match prior {
            Some(prior) if present => prior,
            _ => {
                return Err(Error::ConflictResolution(format!(
                    "cannot keep local version of {}: file is missing",
                    item.id
                )))
            }
        };

        if self.merge == MergeBoundary::AppendToEnd && hash != prior.content_hash {
            let local = self.files.read(&prior.path).await?;
            let (_, body) = split_frontmatter(rendered);
            let merged = format!(
                "{}\n\n---\n\n## Remote update ({})\n\n{}\n",
                local.trim_end(),
                Utc::now().format("%Y-%m-%d %H:%M UTC"),
                body.trim()
            );
            self.files.write(&prior.path, &merged).await?;
            debug!("Appended remote update to {}", prior.path);
        }

        Ok(WriteOutcome {
            action: WriteAction::MergedIntoLocal,
            path: prior.path.clone(),
            content_hash: hash,
        })
    }

    async fn update_existing(
        &self,
        store: &StateStore,
        item: &Item,
        prior: &FileMetadata,
        rendered: String,
        hash: String,
        overwrite: bool,
    ) -> Result<WriteOutcome> {
        if !overwrite && hash == prior.content_hash {
            return Ok(WriteOutcome {
                action: WriteAction::Unchanged,
                path: prior.path.clone(),
                content_hash: hash,
            });
        }

        let mut path = prior.path.clone();
        let existing = self.files.read(&prior.path).await?;
        if frontmatter_field(&existing, "title") != frontmatter_field(&rendered, "title") {
            let generated = self.paths.generate(item)?;
            if generated != prior.path {
                let target = self.free_path(store, &item.id, &generated).await?;
                if target != prior.path {
                    self.files.rename(&prior.path, &target).await?;
                    debug!("Renamed {} -> {}", prior.path, target);
                    path = target;
                }
            }
        }

        self.files.write(&path, &rendered).await?;
        Ok(WriteOutcome {
            action: WriteAction::Updated,
            path,
            content_hash: hash,
        })
    }

    async fn place_new(
        &self,
        store: &StateStore,
        item: &Item,
        tracked: bool,
        rendered: String,
        hash: String,
    ) -> Result<WriteOutcome> {
        let generated = self.paths.generate(item)?;
        let path = self.free_path(store, &item.id, &generated).await?;
        self.files.write(&path, &rendered).await?;

        Ok(WriteOutcome {
            action: if tracked {
                WriteAction::Updated
            } else {
                WriteAction::Created
            },
            path,
            content_hash: hash,
        })
    }

    /// First of `base`, `base (2)`, `base (3)`, ... that `id` may write to.
    ///
    /// A path is usable if it is free, already tracked for `id`, or holds an
    /// untracked file whose frontmatter names `id`.
    async fn free_path(
        &self,
        store: &StateStore,
        id: &RemoteId,
        base: &MirrorPath,
    ) -> Result<MirrorPath> {
        for n in 1..=MAX_COUNTER {
            let candidate = if n == 1 {
                base.clone()
            } else {
                base.with_counter(n)
            };

            match store.owner_of(&candidate) {
                Some(owner) if owner == id => return Ok(candidate),
                Some(_) => continue,
                None => {}
            }

            if !self.files.exists(&candidate).await? {
                return Ok(candidate);
            }
            let text = self.files.read(&candidate).await?;
            if frontmatter_field(&text, &self.frontmatter_key).as_deref() == Some(id.as_str()) {
                debug!("Adopting existing file {} for {}", candidate, id);
                return Ok(candidate);
            }
        }

        Err(Error::AlreadyExists(format!(
            "no free path near {} for {}",
            base, id
        )))
    }
}
