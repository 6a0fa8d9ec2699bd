//! Batch preparation stage.
//!
//! Fans out one preparation task per input document, all running
//! concurrently against the read-only store handles, then linearizes the
//! results: documents that need storage, the flat list of chunk texts that
//! need embedding, and per-document embed targets so a single batched
//! embedding call can be sliced back to its owners in O(1).
//!
//! Each task is independent — hash check, reference work, chunking,
//! permission population, chunk diffing — and an error in any one task
//! fails the whole batch. A partially prepared batch could leave the
//! reference graph inconsistent, so there is no per-document skipping on
//! error.

use anyhow::{Context, Result};
use futures::future;
use tracing::{debug, warn};

use crate::diff::compute_chunk_diff;
use crate::hash::{make_content_hash, should_index};
use crate::models::{
    ChunkDiff, Document, DocumentTouch, IndexOptions, PreparedDocument,
};
use crate::references::{
    calculate_referrer_score, calculate_referrers, find_references, prepare_referrer_updates,
};
use crate::sources::SourceDocument;
use crate::store::TenantStores;

/// Linearized output of batch preparation.
#[derive(Default)]
pub struct BatchPreparation {
    pub prepared: Vec<PreparedDocument>,
    /// Documents the hash check skipped, still owed a permission and
    /// backfill-marker refresh.
    pub touched: Vec<DocumentTouch>,
    /// Chunk texts needing embedding, concatenated across `prepared` in
    /// document order. Slicing by each document's `embed_targets` length
    /// recovers per-document embeddings after one batched embedding call.
    pub chunk_texts: Vec<String>,
}

enum PrepOutcome {
    Indexed(Box<PreparedDocument>),
    Skipped(DocumentTouch),
}

/// Prepare a batch of source documents for indexing. Preparation tasks run
/// concurrently; output order matches input order.
pub async fn prepare_documents_batch(
    documents: &[&dyn SourceDocument],
    stores: &TenantStores,
    incremental: bool,
    opts: &IndexOptions,
) -> Result<BatchPreparation> {
    let tasks = documents
        .iter()
        .map(|doc| prepare_one(*doc, stores, incremental, opts));
    let outcomes = future::try_join_all(tasks).await?;

    let mut prep = BatchPreparation::default();
    for outcome in outcomes {
        match outcome {
            PrepOutcome::Indexed(prepared) => {
                for &idx in &prepared.embed_targets {
                    prep.chunk_texts.push(prepared.chunks[idx].content.clone());
                }
                prep.prepared.push(*prepared);
            }
            PrepOutcome::Skipped(touch) => prep.touched.push(touch),
        }
    }

    debug!(
        tenant = %stores.tenant_id,
        prepared = prep.prepared.len(),
        skipped = prep.touched.len(),
        chunks_to_embed = prep.chunk_texts.len(),
        "batch preparation complete"
    );
    Ok(prep)
}

async fn prepare_one(
    doc: &dyn SourceDocument,
    stores: &TenantStores,
    incremental: bool,
    opts: &IndexOptions,
) -> Result<PrepOutcome> {
    let document_id = doc.id().to_string();
    let metadata = doc.metadata();
    let content_hash = make_content_hash(doc.content(), &metadata);

    if !should_index(
        stores.documents.as_ref(),
        &document_id,
        &content_hash,
        opts.force_reindex,
    )
    .await
    {
        return Ok(PrepOutcome::Skipped(DocumentTouch {
            document_id,
            permission_policy: doc.permission_policy().to_string(),
            permission_allowed_tokens: doc.permission_allowed_tokens(),
            backfill_id: opts.backfill_id.clone(),
        }));
    }

    let existing = stores
        .documents
        .get_document(&document_id)
        .await
        .with_context(|| format!("fetching prior state for document {}", document_id))?;

    let reference_id = doc.reference_id();
    let old_referenced_docs = existing
        .as_ref()
        .map(|e| e.referenced_docs.clone())
        .unwrap_or_default();
    let new_referenced_docs = find_references(doc.content(), doc.source(), &reference_id);

    // Reverse lookup and forward diff hit disjoint rows; run them together.
    let (referrers, referrer_updates) = tokio::try_join!(
        calculate_referrers(stores.documents.as_ref(), &reference_id),
        prepare_referrer_updates(
            stores.documents.as_ref(),
            &reference_id,
            &old_referenced_docs,
            &new_referenced_docs,
        ),
    )
    .with_context(|| format!("reference-graph work for document {}", document_id))?;

    let mut chunks = doc.embedding_chunks();
    for chunk in &mut chunks {
        chunk.permission_policy = doc.permission_policy().to_string();
        chunk.permission_allowed_tokens = doc.permission_allowed_tokens();
    }

    let chunk_diff = compute_diff_if_possible(
        stores,
        &document_id,
        &chunks,
        existing.is_some(),
        incremental,
        opts.force_reindex,
    )
    .await;

    let embed_targets = match &chunk_diff {
        Some(diff) => diff.embed_targets(),
        None => (0..chunks.len()).collect(),
    };

    let referrer_score = calculate_referrer_score(&referrers);
    let record = Document {
        id: document_id,
        content: doc.content().to_string(),
        content_hash,
        metadata,
        source: doc.source().to_string(),
        source_created_at: doc.source_created_at(),
        source_updated_at: doc.source_updated_at(),
        reference_id,
        referenced_docs: new_referenced_docs,
        referrers,
        referrer_score,
        permission_policy: doc.permission_policy().to_string(),
        permission_allowed_tokens: doc.permission_allowed_tokens(),
        last_seen_backfill_id: opts
            .backfill_id
            .clone()
            .or_else(|| existing.and_then(|e| e.last_seen_backfill_id)),
    };

    Ok(PrepOutcome::Indexed(Box::new(PreparedDocument {
        record,
        chunks,
        chunk_diff,
        embed_targets,
        referrer_updates,
    })))
}

/// Compute the chunk diff when incremental indexing applies.
///
/// Diffing needs deterministic chunk IDs; without them the document takes
/// the full-reindex path. A failed chunk-hash lookup also downgrades to a
/// full reindex — redundant embedding work is preferable to skipping the
/// document and losing an update.
async fn compute_diff_if_possible(
    stores: &TenantStores,
    document_id: &str,
    chunks: &[crate::models::EmbeddingChunk],
    previously_indexed: bool,
    incremental: bool,
    force: bool,
) -> Option<ChunkDiff> {
    if !incremental || force {
        return None;
    }
    if chunks.iter().any(|c| c.deterministic_id.is_none()) {
        return None;
    }
    if !previously_indexed {
        // First index: nothing stored, every chunk is new.
        return Some(compute_chunk_diff(chunks, &Default::default()));
    }

    match stores.vectors.chunk_hashes(document_id).await {
        Ok(existing_hashes) => Some(compute_chunk_diff(chunks, &existing_hashes)),
        Err(e) => {
            warn!(
                document_id,
                error = %e,
                "chunk hash lookup failed, falling back to full reindex"
            );
            None
        }
    }
}
