//! MinuteSync sync engine
//!
//! Mirrors items from a remote meeting-notes service into a local Markdown
//! tree:
//! - Rate-limited, retried fetching with adaptive batch sizing
//! - Transactional sync state with backups, migration and recovery
//! - Conflict detection against local edits
//! - Single-flight scheduling with manual and periodic modes
//! - Debounced persistence of local file events

pub mod batch;
pub mod conflict;
pub mod engine;
pub mod fetch;
pub mod migrate;
pub mod persist;
pub mod rate_limit;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod watcher;
pub mod writer;

// Re-export main types
pub use batch::{BatchConfig, BatchSizer};
pub use conflict::{
    detect_conflict, AlwaysKeepRemote, Conflict, ConflictKind, ConflictPolicy, LocalFacts,
    Resolution, ResolutionTable,
};
pub use engine::{
    ItemFilter, ProgressFn, SyncConfig, SyncEngine, SyncErrorRecord, SyncOptions, SyncPhase,
    SyncProgress, SyncReport,
};
pub use fetch::{FetchConfig, FetchCoordinator, Secondaries};
pub use persist::{PersistDebouncer, PersistHandle};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use render::{ContentRenderer, DatePathGenerator, MarkdownRenderer, PathGenerator};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use state::{FileMetadata, Operation, OperationKind, SyncState, Transaction};
pub use store::{state_dir_for, InitOutcome, StateInspection, StateStore};
pub use watcher::EventPump;
pub use writer::{DocumentWriter, MergeBoundary, WriteAction, WriteOutcome};

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
