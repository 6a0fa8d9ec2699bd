//! Storage abstraction for the indexing pipeline.
//!
//! Three backends with different consistency models sit behind these traits:
//! the relational store ([`DocumentStore`]), the full-text search index
//! ([`SearchIndex`]), and the vector store ([`VectorStore`]). The ingest and
//! deletion engines both depend on this module — and only this module — for
//! storage, so neither needs to know about the other.
//!
//! Every handle is **tenant-scoped by construction**: a handle is built once
//! for a validated tenant and none of its methods accept an index or
//! namespace parameter, so a wrong-tenant call is unrepresentable rather
//! than checked at runtime.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod opensearch;
pub mod postgres;
pub mod turbopuffer;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkRow, Document, DocumentTouch, RefCountMap, ReferrerUpdate};

/// A referrer-update target row fetched from the relational store: enough
/// state to rewrite one document's `referrers` map without touching its
/// other fields.
#[derive(Debug, Clone)]
pub struct ReferrerTarget {
    pub document_id: String,
    pub reference_id: String,
    pub referrers: RefCountMap,
}

/// Relational document store, scoped to one tenant.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`content_hash`](DocumentStore::content_hash) | Stored hash for the skip check |
/// | [`get_document`](DocumentStore::get_document) | Full record (prior reference state, deletion lookups) |
/// | [`referrer_targets`](DocumentStore::referrer_targets) | Batched fetch of referrer-update targets |
/// | [`find_referrers`](DocumentStore::find_referrers) | Inverted containment lookup over `referenced_docs` |
/// | [`write_batch`](DocumentStore::write_batch) | Transactional batch upsert + touch-ups + referrer updates |
/// | [`delete_document`](DocumentStore::delete_document) | Transactional delete with referrer repair |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stored content hash for a document, `None` when not indexed yet.
    async fn content_hash(&self, document_id: &str) -> Result<Option<String>>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    /// Fetch current referrer state for every stored document whose
    /// `reference_id` is in `reference_ids`. Unknown IDs are omitted.
    async fn referrer_targets(&self, reference_ids: &[String]) -> Result<Vec<ReferrerTarget>>;

    /// Every document whose `referenced_docs` contains `reference_id`,
    /// returned as `{that document's reference_id: its recorded count}`.
    async fn find_referrers(&self, reference_id: &str) -> Result<RefCountMap>;

    /// Atomically upsert documents and permissions, refresh skipped-but-seen
    /// documents, and apply referrer updates — one transaction, advisory
    /// locks over every touched document ID in globally sorted order.
    async fn write_batch(
        &self,
        documents: &[Document],
        touches: &[DocumentTouch],
        referrer_updates: &[ReferrerUpdate],
    ) -> Result<()>;

    /// Atomically apply referrer updates, delete the permissions row, and
    /// delete the document row. Returns `false` when the document did not
    /// exist.
    async fn delete_document(
        &self,
        document_id: &str,
        referrer_updates: &[ReferrerUpdate],
    ) -> Result<bool>;
}

/// Full-text search index, scoped to one tenant's index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Bulk-index documents with full replace semantics per document.
    /// Partial per-item failures must surface as an error.
    async fn bulk_index(&self, documents: &[Document]) -> Result<()>;

    /// Apply `referrer_score` / `referrers` as a partial upsert to each
    /// affected document, without touching other fields.
    async fn bulk_update_scores(&self, updates: &[ReferrerUpdate]) -> Result<()>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;
}

/// Vector store, scoped to one tenant's namespace.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Chunk ID → content hash for every chunk of a document. Idempotent
    /// read; implementations retry transient failures.
    async fn chunk_hashes(&self, document_id: &str) -> Result<HashMap<String, String>>;

    /// Delete specific chunks by ID.
    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<()>;

    /// Upsert chunk rows without deleting anything.
    async fn upsert_chunks(&self, rows: &[ChunkRow]) -> Result<()>;

    /// Delete every chunk of the document and upsert the replacement set in
    /// the same write, so no stale chunk survives and readers never observe
    /// an empty document.
    async fn replace_document_chunks(&self, document_id: &str, rows: &[ChunkRow]) -> Result<()>;

    /// Delete every chunk of the document.
    async fn purge_document(&self, document_id: &str) -> Result<()>;
}

/// The three tenant-scoped handles the pipeline writes through.
#[derive(Clone)]
pub struct TenantStores {
    pub tenant_id: String,
    pub documents: Arc<dyn DocumentStore>,
    pub search: Arc<dyn SearchIndex>,
    pub vectors: Arc<dyn VectorStore>,
}

impl TenantStores {
    pub fn new(
        tenant_id: impl Into<String>,
        documents: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchIndex>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            documents,
            search,
            vectors,
        }
    }
}
