//! Remote source trait definition and the item model it serves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use minutesync_common::{RemoteId, Result};

/// One record from the remote collection (one meeting).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Stable remote identifier.
    pub id: RemoteId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Creation time, used for path generation.
    pub created_at: DateTime<Utc>,
    /// Last remote modification time.
    pub updated_at: DateTime<Utc>,
    /// Free-form notes body (markdown).
    #[serde(default)]
    pub notes: Option<String>,
    /// Generated summary.
    #[serde(default)]
    pub summary: Option<String>,
    /// Attendee display names.
    #[serde(default)]
    pub attendees: Vec<String>,
    /// Whether the meeting has ended and its notes are final.
    #[serde(default = "default_completed")]
    pub completed: bool,
}

fn default_completed() -> bool {
    true
}

impl Item {
    /// Create a completed item with no body.
    pub fn new(id: RemoteId, title: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            created_at: at,
            updated_at: at,
            notes: None,
            summary: None,
            attendees: Vec::new(),
            completed: true,
        }
    }

    /// Set the notes body.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set the remote modification time.
    pub fn updated(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// Mark as still in progress.
    pub fn in_progress(mut self) -> Self {
        self.completed = false;
        self
    }
}

/// Kinds of per-item secondary resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryKind {
    /// Structured note panels.
    Panels,
    /// Meeting transcript. Heavier than panels.
    Transcript,
}

impl SecondaryKind {
    /// Path segment used by the HTTP API.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecondaryKind::Panels => "panels",
            SecondaryKind::Transcript => "transcript",
        }
    }
}

impl fmt::Display for SecondaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured note panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Panel body, already converted to markdown by the remote.
    #[serde(default)]
    pub content: String,
}

/// One utterance in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    #[serde(default)]
    pub speaker: Option<String>,
    pub text: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// A fetched secondary resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum SecondaryResource {
    Panels(Vec<Panel>),
    Transcript(Vec<TranscriptEntry>),
}

impl SecondaryResource {
    /// The kind of this resource.
    pub fn kind(&self) -> SecondaryKind {
        match self {
            SecondaryResource::Panels(_) => SecondaryKind::Panels,
            SecondaryResource::Transcript(_) => SecondaryKind::Transcript,
        }
    }

    /// Whether the resource carries no content.
    pub fn is_empty(&self) -> bool {
        match self {
            SecondaryResource::Panels(p) => p.is_empty(),
            SecondaryResource::Transcript(t) => t.is_empty(),
        }
    }
}

/// Remote document source.
///
/// Implementations handle their own authentication. Rate limiting and retries are
/// applied by the caller.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Get the source name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Check that the remote is reachable and accepts our credentials.
    ///
    /// # Errors
    /// - Network errors when the remote cannot be contacted at all
    async fn test_connection(&self) -> Result<bool>;

    /// List items modified strictly after `since`.
    async fn list_items_since(&self, since: DateTime<Utc>) -> Result<Vec<Item>>;

    /// List every item.
    async fn list_all_items(&self) -> Result<Vec<Item>>;

    /// Fetch one secondary resource for an item.
    ///
    /// # Errors
    /// - Item not found
    /// - Network/authentication errors
    async fn fetch_secondary(&self, id: &RemoteId, kind: SecondaryKind)
        -> Result<SecondaryResource>;
}
