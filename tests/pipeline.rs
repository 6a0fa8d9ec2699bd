//! End-to-end pipeline tests against the in-memory store implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use docgraph::chunk::split_into_chunks;
use docgraph::config::IndexingConfig;
use docgraph::deletion::{delete_document_and_chunks, delete_documents_batch};
use docgraph::embedding::EmbeddingProvider;
use docgraph::hash::should_index;
use docgraph::ingest::index_documents;
use docgraph::models::{
    Document, DocumentTouch, EmbeddingChunk, IndexOptions, Metadata, RefCountMap, ReferrerUpdate,
};
use docgraph::sources::SourceDocument;
use docgraph::store::memory::{MemoryDocumentStore, MemorySearchIndex, MemoryVectorStore};
use docgraph::store::{DocumentStore, ReferrerTarget, SearchIndex, TenantStores};

// ── test doubles ────────────────────────────────────────────────────────

struct TestDoc {
    id: String,
    source: String,
    content: String,
    metadata: Metadata,
    reference_id: Option<String>,
    max_tokens: usize,
}

impl TestDoc {
    fn new(id: &str, source: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            content: content.to_string(),
            metadata: Metadata::new(),
            reference_id: None,
            max_tokens: 512,
        }
    }

    fn with_reference_id(mut self, reference_id: &str) -> Self {
        self.reference_id = Some(reference_id.to_string());
        self
    }

    fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn with_content(mut self, content: &str) -> Self {
        self.content = content.to_string();
        self
    }
}

impl SourceDocument for TestDoc {
    fn id(&self) -> &str {
        &self.id
    }
    fn source(&self) -> &str {
        &self.source
    }
    fn content(&self) -> &str {
        &self.content
    }
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
    fn reference_id(&self) -> String {
        self.reference_id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.source, self.id))
    }
    fn permission_policy(&self) -> &str {
        "org"
    }
    fn permission_allowed_tokens(&self) -> Vec<String> {
        vec!["team-a".to_string()]
    }
    fn embedding_chunks(&self) -> Vec<EmbeddingChunk> {
        split_into_chunks(&self.id, &self.content, self.max_tokens)
    }
}

struct FakeEmbedder {
    calls: AtomicUsize,
    embedded: Mutex<Vec<String>>,
}

impl FakeEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            embedded: Mutex::new(Vec::new()),
        }
    }

    fn embedded_texts(&self) -> Vec<String> {
        self.embedded.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn create_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 2.0, 3.0])
            .collect())
    }
}

/// Search index whose bulk_index always fails, for writer-isolation tests.
struct FailingSearchIndex;

#[async_trait]
impl SearchIndex for FailingSearchIndex {
    async fn bulk_index(&self, _documents: &[Document]) -> Result<()> {
        anyhow::bail!("search index unavailable")
    }
    async fn bulk_update_scores(&self, _updates: &[ReferrerUpdate]) -> Result<()> {
        Ok(())
    }
    async fn delete_document(&self, _document_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Document store whose reads fail, for preparation-abort tests.
struct FailingDocumentStore;

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn content_hash(&self, _document_id: &str) -> Result<Option<String>> {
        anyhow::bail!("relational store unavailable")
    }
    async fn get_document(&self, _document_id: &str) -> Result<Option<Document>> {
        anyhow::bail!("relational store unavailable")
    }
    async fn referrer_targets(&self, _reference_ids: &[String]) -> Result<Vec<ReferrerTarget>> {
        anyhow::bail!("relational store unavailable")
    }
    async fn find_referrers(&self, _reference_id: &str) -> Result<RefCountMap> {
        anyhow::bail!("relational store unavailable")
    }
    async fn write_batch(
        &self,
        _documents: &[Document],
        _touches: &[DocumentTouch],
        _referrer_updates: &[ReferrerUpdate],
    ) -> Result<()> {
        anyhow::bail!("relational store unavailable")
    }
    async fn delete_document(
        &self,
        _document_id: &str,
        _referrer_updates: &[ReferrerUpdate],
    ) -> Result<bool> {
        anyhow::bail!("relational store unavailable")
    }
}

struct TestEnv {
    docs: Arc<MemoryDocumentStore>,
    search: Arc<MemorySearchIndex>,
    vectors: Arc<MemoryVectorStore>,
    stores: TenantStores,
    embedder: FakeEmbedder,
    config: IndexingConfig,
}

fn env() -> TestEnv {
    let docs = Arc::new(MemoryDocumentStore::new());
    let search = Arc::new(MemorySearchIndex::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let stores = TenantStores::new("acme", docs.clone(), search.clone(), vectors.clone());
    TestEnv {
        docs,
        search,
        vectors,
        stores,
        embedder: FakeEmbedder::new(),
        config: IndexingConfig::default(),
    }
}

async fn index(env: &TestEnv, documents: &[&TestDoc], opts: &IndexOptions) -> Result<()> {
    let documents: Vec<&dyn SourceDocument> =
        documents.iter().map(|d| *d as &dyn SourceDocument).collect();
    index_documents(&env.config, &env.stores, &env.embedder, &documents, opts).await?;
    Ok(())
}

// ── indexing basics ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_document_lands_in_all_three_stores() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Alpha paragraph.\n\nBeta paragraph.");

    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();

    let record = env.docs.document("d1").expect("relational record");
    assert!(!record.content_hash.is_empty());
    assert_eq!(record.permission_policy, "org");
    assert_eq!(record.permission_allowed_tokens, vec!["team-a".to_string()]);

    assert!(env.search.document("d1").is_some());

    let chunks = env.vectors.chunks_for("d1");
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert_eq!(chunk.embedding.len(), 4);
        assert_eq!(chunk.permission_policy, "org");
    }
}

#[tokio::test]
async fn test_round_trip_reindex_embeds_nothing() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Alpha paragraph.\n\nBeta paragraph.");

    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();
    let hash_before = env.docs.document("d1").unwrap().content_hash;
    let embedded_before = env.embedder.embedded_texts().len();

    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();

    assert_eq!(env.embedder.embedded_texts().len(), embedded_before);
    assert_eq!(env.docs.document("d1").unwrap().content_hash, hash_before);
}

#[tokio::test]
async fn test_should_index_idempotence() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Some content.");
    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();

    let stored_hash = env.docs.document("d1").unwrap().content_hash;
    assert!(!should_index(env.docs.as_ref(), "d1", &stored_hash, false).await);
    assert!(should_index(env.docs.as_ref(), "d1", "different", false).await);
    assert!(should_index(env.docs.as_ref(), "d1", &stored_hash, true).await);
    assert!(should_index(env.docs.as_ref(), "unknown", &stored_hash, false).await);
}

#[tokio::test]
async fn test_incremental_reindex_embeds_only_changed_chunk() {
    let env = env();
    let paragraphs: Vec<String> = (0..10)
        .map(|i| format!("Paragraph number {} with some filler text.", i))
        .collect();
    let doc = TestDoc::new("d1", "notion", &paragraphs.join("\n\n")).with_max_tokens(15);

    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();
    assert_eq!(env.vectors.chunks_for("d1").len(), 10);
    let before: HashMap<String, String> = env
        .vectors
        .chunks_for("d1")
        .into_iter()
        .map(|c| (c.id, c.content_hash))
        .collect();

    let mut edited = paragraphs.clone();
    edited[3] = "Paragraph number 3 was rewritten entirely.".to_string();
    let doc = doc.with_content(&edited.join("\n\n"));

    let embedded_before = env.embedder.embedded_texts().len();
    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();

    let embedded = env.embedder.embedded_texts();
    assert_eq!(embedded.len() - embedded_before, 1);
    assert!(embedded.last().unwrap().contains("rewritten"));

    let after: HashMap<String, String> = env
        .vectors
        .chunks_for("d1")
        .into_iter()
        .map(|c| (c.id, c.content_hash))
        .collect();
    assert_eq!(after.len(), 10);
    let mut changed = 0;
    for (id, hash) in &after {
        if before.get(id) != Some(hash) {
            changed += 1;
        }
    }
    assert_eq!(changed, 1);
}

#[tokio::test]
async fn test_force_reindex_embeds_everything_again() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Alpha.\n\nBeta.");

    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();
    let embedded_before = env.embedder.embedded_texts().len();

    let opts = IndexOptions {
        force_reindex: true,
        ..Default::default()
    };
    index(&env, &[&doc], &opts).await.unwrap();

    assert!(env.embedder.embedded_texts().len() > embedded_before);
}

#[tokio::test]
async fn test_document_emptied_purges_all_chunks() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Alpha.\n\nBeta.");
    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();
    assert!(!env.vectors.chunks_for("d1").is_empty());

    let doc = doc.with_content("");
    let embedded_before = env.embedder.embedded_texts().len();
    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();

    assert!(env.vectors.chunks_for("d1").is_empty());
    assert_eq!(env.embedder.embedded_texts().len(), embedded_before);
}

#[tokio::test]
async fn test_vector_store_only_skips_other_writers() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Alpha paragraph.");
    let opts = IndexOptions {
        vector_store_only: true,
        ..Default::default()
    };

    index(&env, &[&doc], &opts).await.unwrap();

    assert!(env.docs.is_empty());
    assert!(env.search.is_empty());
    assert!(!env.vectors.chunks_for("d1").is_empty());
}

#[tokio::test]
async fn test_backfill_marker_applies_to_skipped_documents() {
    let env = env();
    let doc = TestDoc::new("d1", "notion", "Stable content.");
    index(&env, &[&doc], &IndexOptions::default()).await.unwrap();
    assert_eq!(env.docs.document("d1").unwrap().last_seen_backfill_id, None);

    let opts = IndexOptions {
        backfill_id: Some("bf-2024-07".to_string()),
        ..Default::default()
    };
    index(&env, &[&doc], &opts).await.unwrap();

    assert_eq!(
        env.docs.document("d1").unwrap().last_seen_backfill_id,
        Some("bf-2024-07".to_string())
    );
}

// ── reference graph ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_reference_updates_target_referrers() {
    let env = env();
    let pr = TestDoc::new("d2", "github", "Adds the retry logic.").with_reference_id("pr_42");
    index(&env, &[&pr], &IndexOptions::default()).await.unwrap();

    let note = TestDoc::new("d1", "github", "See PR #42 for details.");
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();

    let target = env.docs.document("d2").unwrap();
    assert_eq!(target.referrers.get("github_d1"), Some(&1));
    assert!((target.referrer_score - 1.0).abs() < 1e-12);

    // The search index received the partial score update too.
    let search_doc = env.search.document("d2").unwrap();
    assert_eq!(search_doc["referrers"]["github_d1"], 1);
}

#[tokio::test]
async fn test_removed_reference_clears_target_referrers() {
    let env = env();
    let pr = TestDoc::new("d2", "github", "Adds the retry logic.").with_reference_id("pr_42");
    let note = TestDoc::new("d1", "github", "See PR #42 for details.");
    index(&env, &[&pr], &IndexOptions::default()).await.unwrap();
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();
    assert!(env.docs.document("d2").unwrap().referrers.contains_key("github_d1"));

    let note = note.with_content("No more references here.");
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();

    let target = env.docs.document("d2").unwrap();
    assert!(!target.referrers.contains_key("github_d1"));
    assert_eq!(target.referrer_score, 0.0);
}

#[tokio::test]
async fn test_late_indexed_target_picks_up_existing_referrers() {
    let env = env();
    // The note lands before its target exists; the link is one-sided.
    let note = TestDoc::new("d1", "github", "See PR #42.");
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();

    // When the target arrives, the reverse lookup finds the note.
    let pr = TestDoc::new("d2", "github", "Adds the retry logic.").with_reference_id("pr_42");
    index(&env, &[&pr], &IndexOptions::default()).await.unwrap();

    let target = env.docs.document("d2").unwrap();
    assert_eq!(target.referrers.get("github_d1"), Some(&1));
    assert!((target.referrer_score - 1.0).abs() < 1e-12);
}

#[tokio::test]
async fn test_reference_count_changes_propagate() {
    let env = env();
    let pr = TestDoc::new("d2", "github", "Retry logic.").with_reference_id("pr_42");
    index(&env, &[&pr], &IndexOptions::default()).await.unwrap();

    let note = TestDoc::new("d1", "github", "See #42.");
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();
    assert_eq!(env.docs.document("d2").unwrap().referrers.get("github_d1"), Some(&1));

    let note = note.with_content("See #42 and #42 again.");
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();
    assert_eq!(env.docs.document("d2").unwrap().referrers.get("github_d1"), Some(&2));
}

// ── deletion ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_deletion_removes_document_and_repairs_graph() {
    let env = env();
    let pr = TestDoc::new("d2", "github", "Retry logic.").with_reference_id("pr_42");
    let note = TestDoc::new("d1", "github", "See PR #42.");
    index(&env, &[&pr], &IndexOptions::default()).await.unwrap();
    index(&env, &[&note], &IndexOptions::default()).await.unwrap();
    assert!(env.docs.document("d2").unwrap().referrers.contains_key("github_d1"));

    let existed = delete_document_and_chunks(&env.stores, "d1").await.unwrap();
    assert!(existed);

    assert!(env.docs.document("d1").is_none());
    assert!(env.search.document("d1").is_none());
    assert!(env.vectors.chunks_for("d1").is_empty());

    let target = env.docs.document("d2").unwrap();
    assert!(!target.referrers.contains_key("github_d1"));
    assert_eq!(target.referrer_score, 0.0);
}

#[tokio::test]
async fn test_deleting_missing_document_is_not_an_error() {
    let env = env();
    let existed = delete_document_and_chunks(&env.stores, "ghost").await.unwrap();
    assert!(!existed);
}

#[tokio::test]
async fn test_batch_deletion_counts_missing_documents() {
    let env = env();
    let doc_a = TestDoc::new("d1", "notion", "Alpha.");
    let doc_b = TestDoc::new("d2", "notion", "Beta.");
    index(&env, &[&doc_a, &doc_b], &IndexOptions::default()).await.unwrap();

    let ids = vec!["d1".to_string(), "ghost".to_string(), "d2".to_string()];
    let outcome = delete_documents_batch(&env.config, &env.stores, &ids).await.unwrap();

    assert_eq!(outcome.deleted, 2);
    assert_eq!(outcome.missing, 1);
    assert_eq!(outcome.failed, 0);
    assert!(env.docs.is_empty());
}

// ── job queue ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_job_queue_runs_indexing_and_reports_completion() {
    use docgraph::jobs::{IndexJobQueue, JobStatus};

    let docs = Arc::new(MemoryDocumentStore::new());
    let search = Arc::new(MemorySearchIndex::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let stores = Arc::new(TenantStores::new(
        "acme",
        docs.clone(),
        search.clone(),
        vectors.clone(),
    ));
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(FakeEmbedder::new());

    let queue = IndexJobQueue::start(IndexingConfig::default(), stores, embedder, 4);

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let callback = Box::new(move |status: &JobStatus| {
        let completed = matches!(status, JobStatus::Completed(_));
        let _ = done_tx.send(completed);
    });

    let doc = TestDoc::new("d1", "notion", "Queued content.");
    let job_id = queue
        .submit_with_callback(vec![Box::new(doc)], IndexOptions::default(), Some(callback))
        .await
        .unwrap();

    assert!(done_rx.await.unwrap());
    assert!(matches!(queue.status(job_id), Some(JobStatus::Completed(_))));
    assert!(docs.document("d1").is_some());

    queue.shutdown().await.unwrap();
}

// ── failure handling ────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_writer_surfaces_but_others_still_run() {
    let env = env();
    let stores = TenantStores::new(
        "acme",
        env.docs.clone(),
        Arc::new(FailingSearchIndex),
        env.vectors.clone(),
    );
    let doc = TestDoc::new("d1", "notion", "Alpha paragraph.");
    let documents: Vec<&dyn SourceDocument> = vec![&doc];

    let result = index_documents(
        &env.config,
        &stores,
        &env.embedder,
        &documents,
        &IndexOptions::default(),
    )
    .await;

    assert!(result.is_err());
    // The sibling writers were not short-circuited by the search failure.
    assert!(env.docs.document("d1").is_some());
    assert!(!env.vectors.chunks_for("d1").is_empty());
}

#[tokio::test]
async fn test_preparation_failure_aborts_before_any_write() {
    let env = env();
    let stores = TenantStores::new(
        "acme",
        Arc::new(FailingDocumentStore),
        env.search.clone(),
        env.vectors.clone(),
    );
    let doc = TestDoc::new("d1", "notion", "Alpha paragraph.");
    let documents: Vec<&dyn SourceDocument> = vec![&doc];

    let result = index_documents(
        &env.config,
        &stores,
        &env.embedder,
        &documents,
        &IndexOptions::default(),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(env.embedder.calls.load(Ordering::SeqCst), 0);
    assert!(env.search.is_empty());
    assert!(env.vectors.is_empty());
}
