//! Chunk-level diff computation for incremental embedding.
//!
//! Compares a document's freshly computed chunks against the chunk hashes
//! already stored in the vector store and partitions them into four disjoint
//! categories: new, changed, unchanged, deleted. Only new and changed chunks
//! are re-embedded; deleted chunk IDs are purged; unchanged chunks are left
//! untouched in the vector store.

use std::collections::HashMap;

use crate::models::{ChunkDiff, EmbeddingChunk};

/// Partition `new_chunks` against `existing_hashes` (chunk ID → content hash).
///
/// Single linear pass, O(existing + new). A chunk without a deterministic ID
/// is always treated as new, since it cannot be matched across re-indexes.
pub fn compute_chunk_diff(
    new_chunks: &[EmbeddingChunk],
    existing_hashes: &HashMap<String, String>,
) -> ChunkDiff {
    let mut diff = ChunkDiff::default();
    let mut seen: HashMap<&str, ()> = HashMap::with_capacity(new_chunks.len());

    for (idx, chunk) in new_chunks.iter().enumerate() {
        match chunk.deterministic_id.as_deref() {
            Some(id) => {
                seen.insert(id, ());
                match existing_hashes.get(id) {
                    None => diff.new.push(idx),
                    Some(stored) if stored != &chunk.content_hash => diff.changed.push(idx),
                    Some(_) => diff.unchanged.push(id.to_string()),
                }
            }
            None => diff.new.push(idx),
        }
    }

    for id in existing_hashes.keys() {
        if !seen.contains_key(id.as_str()) {
            diff.deleted.push(id.clone());
        }
    }
    diff.deleted.sort_unstable();

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::chunk_content_hash;

    fn chunk(id: &str, text: &str) -> EmbeddingChunk {
        EmbeddingChunk {
            deterministic_id: Some(id.to_string()),
            content: text.to_string(),
            content_hash: chunk_content_hash(text),
            permission_policy: String::new(),
            permission_allowed_tokens: Vec::new(),
        }
    }

    fn existing(chunks: &[EmbeddingChunk]) -> HashMap<String, String> {
        chunks
            .iter()
            .map(|c| {
                (
                    c.deterministic_id.clone().unwrap(),
                    c.content_hash.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_first_index_all_new() {
        let chunks = vec![chunk("d:0", "alpha"), chunk("d:1", "beta")];
        let diff = compute_chunk_diff(&chunks, &HashMap::new());
        assert_eq!(diff.new, vec![0, 1]);
        assert!(diff.changed.is_empty());
        assert!(diff.unchanged.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_empty_document_all_deleted() {
        let stored = existing(&[chunk("d:0", "alpha"), chunk("d:1", "beta")]);
        let diff = compute_chunk_diff(&[], &stored);
        assert!(diff.new.is_empty());
        assert_eq!(diff.deleted, vec!["d:0".to_string(), "d:1".to_string()]);
    }

    #[test]
    fn test_identical_reindex_all_unchanged() {
        let chunks = vec![chunk("d:0", "alpha"), chunk("d:1", "beta")];
        let diff = compute_chunk_diff(&chunks, &existing(&chunks));
        assert!(diff.is_noop());
        assert_eq!(diff.unchanged.len(), 2);
    }

    #[test]
    fn test_single_chunk_changed() {
        let old = vec![
            chunk("d:0", "alpha"),
            chunk("d:1", "beta"),
            chunk("d:2", "gamma"),
        ];
        let stored = existing(&old);
        let mut new = old.clone();
        new[1] = chunk("d:1", "beta v2");
        let diff = compute_chunk_diff(&new, &stored);
        assert_eq!(diff.changed, vec![1]);
        assert_eq!(diff.unchanged.len(), 2);
        assert!(diff.new.is_empty());
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.embed_targets(), vec![1]);
    }

    #[test]
    fn test_partition_is_complete_and_disjoint() {
        let stored = existing(&[
            chunk("d:0", "keep"),
            chunk("d:1", "edit"),
            chunk("d:2", "drop"),
        ]);
        let new = vec![
            chunk("d:0", "keep"),
            chunk("d:1", "edited"),
            chunk("d:3", "fresh"),
        ];
        let diff = compute_chunk_diff(&new, &stored);

        // Every stored ID lands in exactly one of changed/unchanged/deleted.
        let changed_ids: Vec<&str> = diff
            .changed
            .iter()
            .map(|&i| new[i].deterministic_id.as_deref().unwrap())
            .collect();
        assert_eq!(changed_ids, vec!["d:1"]);
        assert_eq!(diff.unchanged, vec!["d:0".to_string()]);
        assert_eq!(diff.deleted, vec!["d:2".to_string()]);
        // Every new chunk lands in exactly one of new/changed/unchanged.
        assert_eq!(diff.new, vec![2]);
        assert_eq!(
            diff.new.len() + diff.changed.len() + diff.unchanged.len(),
            new.len()
        );
    }

    #[test]
    fn test_chunk_without_id_is_new() {
        let mut c = chunk("d:0", "alpha");
        c.deterministic_id = None;
        let stored = existing(&[chunk("d:0", "alpha")]);
        let diff = compute_chunk_diff(&[c], &stored);
        assert_eq!(diff.new, vec![0]);
        // The stored chunk cannot be matched, so it is purged.
        assert_eq!(diff.deleted, vec!["d:0".to_string()]);
    }
}
