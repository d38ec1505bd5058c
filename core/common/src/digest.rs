//! Content digests.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// Frontmatter fence used by mirrored documents.
pub const FRONTMATTER_FENCE: &str = "---";

/// Hex-encoded 256-bit BLAKE2b digest of `data`.
pub fn digest_hex(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Split a document into its frontmatter block and body.
///
/// Returns `(None, text)` when the document does not open with a fence line
/// or the closing fence is missing.
pub fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONTMATTER_FENCE {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body);
        }
        offset += line.len();
    }
    (None, text)
}

/// Read a scalar `key: value` field from a document's frontmatter.
///
/// Surrounding quotes are stripped. Nested structures are not interpreted.
pub fn frontmatter_field(text: &str, key: &str) -> Option<String> {
    let (front, _) = split_frontmatter(text);
    front?.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);
        if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    })
}

/// Digest of a document body, excluding the frontmatter block.
///
/// Frontmatter carries volatile fields (timestamps, sync markers) that must not
/// register as content changes.
pub fn content_hash(text: &str) -> String {
    let (_, body) = split_frontmatter(text);
    digest_hex(body.trim().as_bytes())
}
