//! Core data models used throughout docgraph.
//!
//! These types represent the documents, chunks, diffs, and referrer-update
//! commands that flow through the indexing and deletion pipelines.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::references::calculate_referrer_score;

/// Open key-value metadata attached to a document by its source connector.
///
/// A `BTreeMap` keeps keys in canonical order so JSON serialization is
/// deterministic, which the content hash depends on.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Occurrence counts keyed by reference ID (`referenced_docs` / `referrers`).
pub type RefCountMap = BTreeMap<String, i64>;

/// Normalized document record persisted in the relational store and mirrored
/// into the search index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, unique per tenant.
    pub id: String,
    /// Full text content used for search and embedding.
    pub content: String,
    /// SHA-256 over the canonical JSON of `{content, metadata}`.
    pub content_hash: String,
    pub metadata: Metadata,
    /// Origin connector label (e.g. `"slack"`, `"github"`).
    pub source: String,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Stable identifier other documents use to refer to this one.
    /// Distinct from `id`; derived from source-specific conventions.
    pub reference_id: String,
    /// Outbound references: reference_id of each document this one mentions,
    /// with occurrence counts.
    pub referenced_docs: RefCountMap,
    /// Inbound references: reference_id of each document mentioning this one,
    /// with the count that document recorded. Bidirectional inverse of
    /// `referenced_docs` across the corpus.
    pub referrers: RefCountMap,
    /// Authority signal derived from `referrers`.
    pub referrer_score: f64,
    pub permission_policy: String,
    pub permission_allowed_tokens: Vec<String>,
    /// Most recent backfill run that observed this document.
    pub last_seen_backfill_id: Option<String>,
}

/// A sub-document unit of text sized for embedding and vector search.
///
/// Permission fields are a point-in-time copy from the parent document,
/// populated during batch preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingChunk {
    /// Stable, position-derived identifier unique within the document.
    /// `None` disables chunk-level diffing for the owning document.
    pub deterministic_id: Option<String>,
    pub content: String,
    /// SHA-256 of this chunk's own content (distinct from the document hash).
    pub content_hash: String,
    pub permission_policy: String,
    pub permission_allowed_tokens: Vec<String>,
}

/// A chunk row as written to the vector store, embedding included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub permission_policy: String,
    pub permission_allowed_tokens: Vec<String>,
}

/// Four-way partition of a document's chunks against the previously stored
/// chunk hashes. `new` and `changed` hold indices into the freshly computed
/// chunk list; `unchanged` and `deleted` hold chunk IDs already in the
/// vector store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkDiff {
    pub new: Vec<usize>,
    pub changed: Vec<usize>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChunkDiff {
    /// Indices of chunks that must be re-embedded (new + changed, in order).
    pub fn embed_targets(&self) -> Vec<usize> {
        let mut targets = self.new.clone();
        targets.extend_from_slice(&self.changed);
        targets.sort_unstable();
        targets
    }

    /// True when nothing needs embedding or purging.
    pub fn is_noop(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Command to apply a partial update to another document's `referrers` map
/// (and derived `referrer_score`) without touching its other fields.
///
/// Produced by the reference-graph engine when processing one document
/// discovers it must alter a different document's inbound-reference state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferrerUpdate {
    /// `reference_id` of the target document.
    pub reference_id: String,
    /// Relational `id` of the target document.
    pub document_id: String,
    /// The target's complete updated referrers map.
    pub referrers: RefCountMap,
    /// Score derived from `referrers`, precomputed so writers stay dumb.
    pub referrer_score: f64,
}

impl ReferrerUpdate {
    pub fn new(reference_id: String, document_id: String, referrers: RefCountMap) -> Self {
        let referrer_score = calculate_referrer_score(&referrers);
        Self {
            reference_id,
            document_id,
            referrers,
            referrer_score,
        }
    }
}

/// Light-weight refresh applied to a document that the hash check skipped:
/// permissions and the backfill marker still update even when content is
/// unchanged.
#[derive(Debug, Clone)]
pub struct DocumentTouch {
    pub document_id: String,
    pub permission_policy: String,
    pub permission_allowed_tokens: Vec<String>,
    pub backfill_id: Option<String>,
}

/// A fully prepared document: relational record, chunk list with permissions
/// populated, the chunk diff (when incremental diffing ran), the indices of
/// chunks needing embedding, and the referrer-update side effects its
/// content change produces.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub record: Document,
    pub chunks: Vec<EmbeddingChunk>,
    /// `None` means diff info was unavailable and the document takes the
    /// full-reindex path in the vector store.
    pub chunk_diff: Option<ChunkDiff>,
    /// Indices into `chunks` to send to the embedding service, in order.
    pub embed_targets: Vec<usize>,
    pub referrer_updates: Vec<ReferrerUpdate>,
}

/// Caller-facing switches for a batch indexing call.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Re-process documents even when the content hash is unchanged.
    pub force_reindex: bool,
    /// Write only to the vector store, skipping the relational and search
    /// writers (backfill repair runs use this).
    pub vector_store_only: bool,
    /// Backfill run observing these documents; stamped onto every document
    /// seen, including ones the hash check skips.
    pub backfill_id: Option<String>,
}

/// Result of a batch indexing call.
#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    pub documents_written: usize,
    pub documents_skipped: usize,
    pub chunks_embedded: usize,
    pub referrer_updates_applied: usize,
}

/// Result of a batch deletion call. Failures are counted, not fatal.
#[derive(Debug, Clone, Default)]
pub struct DeletionOutcome {
    pub deleted: usize,
    pub missing: usize,
    pub failed: usize,
}
