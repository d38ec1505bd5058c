//! Storage collaborators for minutesync.
//!
//! This crate provides both ends of the mirror:
//! - the remote document source (`RemoteSource`), with an HTTP client and an
//!   in-memory implementation for tests
//! - the local file store (`FileStore`), backed by a directory on disk, plus
//!   change notifications for edits made outside the engine
//!
//! # Design Principles
//! - Async operations: All I/O operations are async
//! - No sync policy: rate limiting, retries and conflict handling live in the sync crate
//! - Unified error semantics: Consistent error types across implementations

pub mod file_store;
pub mod http;
pub mod local;
pub mod memory;
pub mod provider;
pub mod watcher;

pub use file_store::{FileEvent, FileStore};
pub use http::HttpRemoteSource;
pub use local::LocalFileStore;
pub use memory::{CallStats, MemoryRemote};
pub use provider::{
    Item, Panel, RemoteSource, SecondaryKind, SecondaryResource, TranscriptEntry,
};
pub use watcher::FileWatcher;
