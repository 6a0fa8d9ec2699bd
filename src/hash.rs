//! Document content hashing and the index-skip decision.
//!
//! The content hash is a SHA-256 over the canonical JSON serialization of
//! `{content, metadata}`. Metadata lives in a `BTreeMap`, so key order — and
//! therefore the hash — is deterministic for equal inputs.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::Metadata;
use crate::store::DocumentStore;

#[derive(Serialize)]
struct HashInput<'a> {
    content: &'a str,
    metadata: &'a Metadata,
}

/// Compute the deterministic content hash for a `(content, metadata)` pair.
///
/// Any change to the content or to any metadata key/value changes the hash.
pub fn make_content_hash(content: &str, metadata: &Metadata) -> String {
    let canonical = serde_json::to_string(&HashInput { content, metadata })
        .unwrap_or_else(|_| content.to_string());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a single chunk's text, used for chunk-level diffing.
pub fn chunk_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Decide whether a document needs (re)indexing.
///
/// Returns `true` when `force` is set, no stored document exists, or the
/// stored hash differs from `new_hash`. A lookup failure also returns `true`:
/// failing open toward re-indexing costs redundant work, while failing open
/// toward skipping would silently lose updates.
pub async fn should_index(
    store: &dyn DocumentStore,
    document_id: &str,
    new_hash: &str,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    match store.content_hash(document_id).await {
        Ok(Some(stored)) => stored != new_hash,
        Ok(None) => true,
        Err(e) => {
            warn!(document_id, error = %e, "content hash lookup failed, re-indexing");
            true
        }
    }
}

/// Stable advisory-lock key derived from a document ID.
///
/// Takes the first eight bytes of the SHA-256 digest as a big-endian `i64`,
/// matching the keyspace of `pg_advisory_xact_lock(bigint)`.
pub fn advisory_lock_key(document_id: &str) -> i64 {
    let digest = Sha256::digest(document_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
