//! Common utilities and types shared across minutesync modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod digest;
pub mod error;
pub mod types;

pub use digest::{content_hash, digest_hex, frontmatter_field, split_frontmatter};
pub use error::{Error, Result};
pub use types::{MirrorPath, RemoteId};
