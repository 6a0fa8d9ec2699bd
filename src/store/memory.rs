//! In-memory implementations of the storage traits for tests.
//!
//! `HashMap`s behind `std::sync::RwLock`. The relational double applies
//! write batches under a single lock, which stands in for the advisory-lock
//! transaction of the Postgres implementation; the search double keeps
//! documents as JSON so partial score updates merge the way a real index's
//! `doc_as_upsert` does.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkRow, Document, DocumentTouch, RefCountMap, ReferrerUpdate};

use super::{DocumentStore, ReferrerTarget, SearchIndex, VectorStore};

/// In-memory relational store.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read access for test assertions.
    pub fn document(&self, document_id: &str) -> Option<Document> {
        self.docs.read().unwrap().get(document_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().unwrap().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn content_hash(&self, document_id: &str) -> Result<Option<String>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(document_id).map(|d| d.content_hash.clone()))
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(document_id).cloned())
    }

    async fn referrer_targets(&self, reference_ids: &[String]) -> Result<Vec<ReferrerTarget>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .values()
            .filter(|d| reference_ids.contains(&d.reference_id))
            .map(|d| ReferrerTarget {
                document_id: d.id.clone(),
                reference_id: d.reference_id.clone(),
                referrers: d.referrers.clone(),
            })
            .collect())
    }

    async fn find_referrers(&self, reference_id: &str) -> Result<RefCountMap> {
        let docs = self.docs.read().unwrap();
        let mut referrers = RefCountMap::new();
        for doc in docs.values() {
            if let Some(count) = doc.referenced_docs.get(reference_id) {
                referrers.insert(doc.reference_id.clone(), *count);
            }
        }
        Ok(referrers)
    }

    async fn write_batch(
        &self,
        documents: &[Document],
        touches: &[DocumentTouch],
        referrer_updates: &[ReferrerUpdate],
    ) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        for doc in documents {
            docs.insert(doc.id.clone(), doc.clone());
        }
        for touch in touches {
            if let Some(existing) = docs.get_mut(&touch.document_id) {
                existing.permission_policy = touch.permission_policy.clone();
                existing.permission_allowed_tokens = touch.permission_allowed_tokens.clone();
                if touch.backfill_id.is_some() {
                    existing.last_seen_backfill_id = touch.backfill_id.clone();
                }
            }
        }
        for update in referrer_updates {
            if let Some(existing) = docs
                .values_mut()
                .find(|d| d.reference_id == update.reference_id)
            {
                existing.referrers = update.referrers.clone();
                existing.referrer_score = update.referrer_score;
            }
        }
        Ok(())
    }

    async fn delete_document(
        &self,
        document_id: &str,
        referrer_updates: &[ReferrerUpdate],
    ) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        for update in referrer_updates {
            if let Some(existing) = docs
                .values_mut()
                .find(|d| d.reference_id == update.reference_id)
            {
                existing.referrers = update.referrers.clone();
                existing.referrer_score = update.referrer_score;
            }
        }
        Ok(docs.remove(document_id).is_some())
    }
}

/// In-memory search index storing documents as JSON.
#[derive(Default)]
pub struct MemorySearchIndex {
    docs: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, document_id: &str) -> Option<serde_json::Value> {
        self.docs.read().unwrap().get(document_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().unwrap().is_empty()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn bulk_index(&self, documents: &[Document]) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        for doc in documents {
            docs.insert(doc.id.clone(), serde_json::to_value(doc)?);
        }
        Ok(())
    }

    async fn bulk_update_scores(&self, updates: &[ReferrerUpdate]) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        for update in updates {
            let partial = serde_json::json!({
                "referrers": update.referrers,
                "referrer_score": update.referrer_score,
            });
            match docs.get_mut(&update.document_id) {
                Some(existing) => {
                    if let Some(obj) = existing.as_object_mut() {
                        obj.insert("referrers".into(), partial["referrers"].clone());
                        obj.insert("referrer_score".into(), partial["referrer_score"].clone());
                    }
                }
                None => {
                    docs.insert(update.document_id.clone(), partial);
                }
            }
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.docs.write().unwrap().remove(document_id);
        Ok(())
    }
}

/// In-memory vector store keyed by chunk ID.
#[derive(Default)]
pub struct MemoryVectorStore {
    rows: RwLock<HashMap<String, ChunkRow>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks_for(&self, document_id: &str) -> Vec<ChunkRow> {
        let mut rows: Vec<ChunkRow> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn chunk_hashes(&self, document_id: &str) -> Result<HashMap<String, String>> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .values()
            .filter(|r| r.document_id == document_id)
            .map(|r| (r.id.clone(), r.content_hash.clone()))
            .collect())
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        for id in chunk_ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn upsert_chunks(&self, new_rows: &[ChunkRow]) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        for row in new_rows {
            rows.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn replace_document_chunks(&self, document_id: &str, new_rows: &[ChunkRow]) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        rows.retain(|_, r| r.document_id != document_id);
        for row in new_rows {
            rows.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn purge_document(&self, document_id: &str) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        rows.retain(|_, r| r.document_id != document_id);
        Ok(())
    }
}
