//! Indexing pipeline orchestration.
//!
//! Coordinates the full flow for a batch of source documents: batch
//! preparation (hash check, reference-graph work, chunking, chunk diffing)
//! → one batched embedding call → three store writers fanned out
//! concurrently. Repeated calls with unchanged documents are cheap no-ops
//! for storage, though permission and backfill-marker refreshes always
//! apply.
//!
//! The three stores are independent systems with no cross-store
//! transaction: each writer is atomic on its own store, writer failures are
//! collected rather than short-circuiting the others, and any failure fails
//! the call. Nothing is rolled back across stores.

use anyhow::{bail, Context, Result};
use futures::future;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::IndexingConfig;
use crate::embedding::EmbeddingProvider;
use crate::models::{
    ChunkRow, Document, IndexOptions, IndexOutcome, PreparedDocument, ReferrerUpdate,
};
use crate::prepare::prepare_documents_batch;
use crate::sources::SourceDocument;
use crate::store::{TenantStores, VectorStore};

/// Per-document vector-store work, assembled after embeddings return.
struct VectorWrite {
    document_id: String,
    /// Rows carrying fresh embeddings (new + changed chunks on the
    /// incremental path, the complete chunk set on the full path).
    rows: Vec<ChunkRow>,
    /// Chunk IDs to purge (incremental path only).
    deleted: Vec<String>,
    /// True when a chunk diff ran and unchanged chunks must survive.
    incremental: bool,
}

/// Index a batch of source documents into all three stores.
///
/// This is the top-level entry point. Idempotent at the content-hash level:
/// a document whose hash is unchanged is skipped, except that its
/// permission rows and `last_seen_backfill_id` still refresh.
pub async fn index_documents(
    config: &IndexingConfig,
    stores: &TenantStores,
    embedder: &dyn EmbeddingProvider,
    documents: &[&dyn SourceDocument],
    opts: &IndexOptions,
) -> Result<IndexOutcome> {
    if documents.is_empty() {
        return Ok(IndexOutcome::default());
    }

    let prep = prepare_documents_batch(documents, stores, config.incremental, opts).await?;

    let chunks_embedded = prep.chunk_texts.len();
    let embeddings = if prep.chunk_texts.is_empty() {
        Vec::new()
    } else {
        embedder
            .create_embeddings_batch(&prep.chunk_texts)
            .await
            .context("embedding chunk batch")?
    };
    if embeddings.len() != prep.chunk_texts.len() {
        bail!(
            "Embedding service returned {} vectors for {} chunks",
            embeddings.len(),
            prep.chunk_texts.len()
        );
    }

    let vector_writes = assemble_vector_writes(&prep.prepared, &embeddings);
    let records: Vec<Document> = prep.prepared.iter().map(|p| p.record.clone()).collect();
    let updates = merge_referrer_updates(&prep.prepared);

    let relational = async {
        if opts.vector_store_only {
            return Ok(());
        }
        stores
            .documents
            .write_batch(&records, &prep.touched, &updates)
            .await
            .context("relational writer")
    };
    let search = async {
        if opts.vector_store_only {
            return Ok(());
        }
        stores
            .search
            .bulk_index(&records)
            .await
            .context("search-index writer")?;
        // The affected set differs from the directly-written set, so the
        // score updates are a separate bulk call.
        stores
            .search
            .bulk_update_scores(&updates)
            .await
            .context("search-index referrer updates")
    };
    let vector = write_vector_store(config, stores.vectors.clone(), vector_writes);

    let (relational_result, search_result, vector_result) =
        tokio::join!(relational, search, vector);

    let mut failures: Vec<String> = Vec::new();
    for result in [relational_result, search_result, vector_result] {
        if let Err(e) = result {
            warn!(tenant = %stores.tenant_id, error = %format!("{:#}", e), "store writer failed");
            failures.push(format!("{:#}", e));
        }
    }
    if !failures.is_empty() {
        bail!(
            "{} of 3 store writers failed: {}",
            failures.len(),
            failures.join(" | ")
        );
    }

    let outcome = IndexOutcome {
        documents_written: records.len(),
        documents_skipped: prep.touched.len(),
        chunks_embedded,
        referrer_updates_applied: updates.len(),
    };
    info!(
        tenant = %stores.tenant_id,
        written = outcome.documents_written,
        skipped = outcome.documents_skipped,
        embedded = outcome.chunks_embedded,
        referrer_updates = outcome.referrer_updates_applied,
        "indexed document batch"
    );
    Ok(outcome)
}

/// Slice the flat embedding list back to its owning documents and build the
/// vector-store rows. Relies on the preparation-stage guarantee that
/// `chunk_texts` concatenates each document's embed targets in order.
fn assemble_vector_writes(
    prepared: &[PreparedDocument],
    embeddings: &[Vec<f32>],
) -> Vec<VectorWrite> {
    let mut writes = Vec::with_capacity(prepared.len());
    let mut offset = 0usize;

    for doc in prepared {
        let mut rows = Vec::with_capacity(doc.embed_targets.len());
        for (slot, &chunk_idx) in doc.embed_targets.iter().enumerate() {
            let chunk = &doc.chunks[chunk_idx];
            rows.push(ChunkRow {
                id: chunk
                    .deterministic_id
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", doc.record.id, chunk_idx)),
                document_id: doc.record.id.clone(),
                content: chunk.content.clone(),
                content_hash: chunk.content_hash.clone(),
                embedding: embeddings[offset + slot].clone(),
                permission_policy: chunk.permission_policy.clone(),
                permission_allowed_tokens: chunk.permission_allowed_tokens.clone(),
            });
        }
        offset += doc.embed_targets.len();

        writes.push(VectorWrite {
            document_id: doc.record.id.clone(),
            rows,
            deleted: doc
                .chunk_diff
                .as_ref()
                .map(|d| d.deleted.clone())
                .unwrap_or_default(),
            incremental: doc.chunk_diff.is_some(),
        });
    }

    writes
}

/// Collect referrer updates across the batch, keeping the last update per
/// target. Two documents in one batch touching the same target both
/// computed from the same stored base, so a single batched UPDATE can only
/// honor one of them; the next re-index of either source reconverges the
/// target's map.
fn merge_referrer_updates(prepared: &[PreparedDocument]) -> Vec<ReferrerUpdate> {
    let mut merged: BTreeMap<String, ReferrerUpdate> = BTreeMap::new();
    for doc in prepared {
        for update in &doc.referrer_updates {
            merged.insert(update.reference_id.clone(), update.clone());
        }
    }
    merged.into_values().collect()
}

/// Vector-store writer.
///
/// Documents with a chunk diff take the incremental path: one delete call
/// for every purged chunk ID across the batch, one upsert for every fresh
/// row — unchanged chunks are never touched. Documents without a diff take
/// the full-reindex path: an atomic delete-and-upsert per document, except
/// that oversized documents delete once and upsert in bounded batches to
/// keep single calls small. Full reindexes run under a semaphore so a large
/// batch cannot flood the store.
async fn write_vector_store(
    config: &IndexingConfig,
    vectors: Arc<dyn VectorStore>,
    writes: Vec<VectorWrite>,
) -> Result<()> {
    let mut incremental_deletes: Vec<String> = Vec::new();
    let mut incremental_rows: Vec<ChunkRow> = Vec::new();
    let mut full_reindexes: Vec<VectorWrite> = Vec::new();

    for write in writes {
        if write.incremental {
            incremental_deletes.extend(write.deleted);
            incremental_rows.extend(write.rows);
        } else {
            full_reindexes.push(write);
        }
    }

    if !incremental_deletes.is_empty() {
        vectors
            .delete_chunks(&incremental_deletes)
            .await
            .context("purging deleted chunks")?;
    }
    if !incremental_rows.is_empty() {
        vectors
            .upsert_chunks(&incremental_rows)
            .await
            .context("upserting changed chunks")?;
    }

    if full_reindexes.is_empty() {
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(config.vector_concurrency.max(1)));
    let tasks = full_reindexes.into_iter().map(|write| {
        let vectors = vectors.clone();
        let semaphore = semaphore.clone();
        let max_atomic = config.max_atomic_chunks;
        let upsert_batch = config.chunk_upsert_batch.max(1);
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .context("vector writer semaphore closed")?;
            if write.rows.len() <= max_atomic {
                vectors
                    .replace_document_chunks(&write.document_id, &write.rows)
                    .await
                    .with_context(|| format!("replacing chunks for {}", write.document_id))
            } else {
                vectors
                    .purge_document(&write.document_id)
                    .await
                    .with_context(|| format!("purging chunks for {}", write.document_id))?;
                for batch in write.rows.chunks(upsert_batch) {
                    vectors
                        .upsert_chunks(batch)
                        .await
                        .with_context(|| format!("upserting chunks for {}", write.document_id))?;
                }
                Ok(())
            }
        }
    });

    future::try_join_all(tasks).await?;
    Ok(())
}
