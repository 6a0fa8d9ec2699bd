//! Document deletion engine.
//!
//! Removes a document and its chunks from all three stores and repairs the
//! reference graph: every document the deleted one pointed to loses the
//! deleted document's entry from its `referrers` map. The relational delete
//! is transactional; the search-index and vector-store cleanups run
//! concurrently after the transaction commits.
//!
//! The batch variant processes IDs in fixed-size sub-batches under a
//! semaphore so a large delete cannot exhaust connection pools, and
//! collects per-document failures instead of aborting the batch.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::IndexingConfig;
use crate::models::DeletionOutcome;
use crate::references::prepare_referrer_updates_for_deletion;
use crate::store::TenantStores;

/// Delete one document and its chunks from all three stores.
///
/// Returns `false` when the document was not present in the relational
/// store (nothing to do; the search index and vector store are still purged
/// in case an earlier partial failure left strays behind).
pub async fn delete_document_and_chunks(
    stores: &TenantStores,
    document_id: &str,
) -> Result<bool> {
    let existing = stores
        .documents
        .get_document(document_id)
        .await
        .with_context(|| format!("looking up document {} for deletion", document_id))?;

    let (existed, updates) = match existing {
        Some(doc) => {
            let updates = prepare_referrer_updates_for_deletion(
                stores.documents.as_ref(),
                &doc.reference_id,
                &doc.referenced_docs,
            )
            .await
            .with_context(|| format!("computing referrer updates for deleting {}", document_id))?;

            let existed = stores
                .documents
                .delete_document(document_id, &updates)
                .await
                .with_context(|| format!("deleting document {} from relational store", document_id))?;
            (existed, updates)
        }
        None => (false, Vec::new()),
    };

    // Relational state is settled; clean up the other two stores and push
    // the score changes to the search index concurrently.
    let scores = stores.search.bulk_update_scores(&updates);
    let search_delete = stores.search.delete_document(document_id);
    let vector_purge = stores.vectors.purge_document(document_id);

    let (scores_result, search_result, vector_result) =
        tokio::join!(scores, search_delete, vector_purge);
    scores_result.context("updating referrer scores in search index")?;
    search_result.context("deleting document from search index")?;
    vector_result.context("purging chunks from vector store")?;

    info!(
        tenant = %stores.tenant_id,
        document_id,
        existed,
        referrer_updates = updates.len(),
        "deleted document"
    );
    Ok(existed)
}

/// Delete many documents, best-effort.
///
/// IDs are processed in fixed-size sub-batches with a bounded-concurrency
/// semaphore. Individual failures are logged and counted; the batch
/// continues.
pub async fn delete_documents_batch(
    config: &IndexingConfig,
    stores: &TenantStores,
    document_ids: &[String],
) -> Result<DeletionOutcome> {
    let mut outcome = DeletionOutcome::default();
    let semaphore = Arc::new(Semaphore::new(config.delete_concurrency.max(1)));

    for batch in document_ids.chunks(config.delete_batch_size.max(1)) {
        let tasks = batch.iter().map(|document_id| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .context("deletion semaphore closed")?;
                delete_document_and_chunks(stores, document_id).await
            }
        });

        for (document_id, result) in batch.iter().zip(future::join_all(tasks).await) {
            match result {
                Ok(true) => outcome.deleted += 1,
                Ok(false) => outcome.missing += 1,
                Err(e) => {
                    warn!(
                        tenant = %stores.tenant_id,
                        document_id = %document_id,
                        error = %format!("{:#}", e),
                        "document deletion failed"
                    );
                    outcome.failed += 1;
                }
            }
        }
    }

    info!(
        tenant = %stores.tenant_id,
        deleted = outcome.deleted,
        missing = outcome.missing,
        failed = outcome.failed,
        "batch deletion complete"
    );
    Ok(outcome)
}
