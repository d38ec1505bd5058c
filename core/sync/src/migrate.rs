//! Schema migrations for the persisted state document.
//!
//! Migrations operate on the raw JSON value before it is deserialized, so older
//! documents never have to fit the current struct layout. Each step raises the
//! version by exactly one.

use serde_json::{json, Map, Value};
use tracing::info;

use minutesync_common::{Error, Result};

use crate::state::CURRENT_VERSION;

/// Timestamp used when an old document carries no usable time at all.
const EPOCH: &str = "1970-01-01T00:00:00Z";

/// Schema version recorded in a raw document. A missing field means version 1.
pub fn document_version(doc: &Value) -> Result<u32> {
    match doc.get("version") {
        None | Some(Value::Null) => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::StateCorruption(format!("invalid version field: {}", v))),
    }
}

/// Bring `doc` up to the current schema.
///
/// Returns the version the document started at.
///
/// # Errors
/// - The document is not a JSON object
/// - The version is newer than this build understands
pub fn migrate(doc: &mut Value) -> Result<u32> {
    if !doc.is_object() {
        return Err(Error::StateCorruption(
            "state document is not an object".to_string(),
        ));
    }

    let from = document_version(doc)?;
    if from > CURRENT_VERSION {
        return Err(Error::StateCorruption(format!(
            "state version {} is newer than supported version {}",
            from, CURRENT_VERSION
        )));
    }

    let mut version = from;
    while version < CURRENT_VERSION {
        match version {
            1 => v1_to_v2(doc),
            2 => v2_to_v3(doc),
            _ => {
                return Err(Error::StateCorruption(format!(
                    "no migration from version {}",
                    version
                )))
            }
        }
        version += 1;
        doc["version"] = json!(version);
        info!("Migrated sync state to version {}", version);
    }

    Ok(from)
}

/// v2 introduces tombstones.
fn v1_to_v2(doc: &mut Value) {
    if let Some(obj) = doc.as_object_mut() {
        if !obj.get("deletedIds").is_some_and(Value::is_array) {
            obj.insert("deletedIds".to_string(), json!([]));
        }
    }
}

/// v3 introduces per-entry sync bookkeeping and the document checksum.
fn v2_to_v3(doc: &mut Value) {
    let last_sync = doc
        .get("lastSync")
        .and_then(Value::as_str)
        .map(str::to_string);

    let files = doc
        .get("files")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut upgraded = Map::new();
    for (key, entry) in files {
        let Value::Object(mut entry) = entry else {
            continue;
        };

        let synced = entry
            .get("lastModified")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| last_sync.clone())
            .unwrap_or_else(|| EPOCH.to_string());

        entry.insert("remoteId".to_string(), json!(key));
        entry
            .entry("lastModified".to_string())
            .or_insert_with(|| json!(synced));
        entry.insert("lastSynced".to_string(), json!(synced));
        entry.insert("syncVersion".to_string(), json!(1));
        entry
            .entry("contentHash".to_string())
            .or_insert_with(|| json!(""));

        upgraded.insert(key, Value::Object(entry));
    }

    if let Some(obj) = doc.as_object_mut() {
        obj.insert("files".to_string(), Value::Object(upgraded));
        obj.insert("checksum".to_string(), json!(""));
    }
}
