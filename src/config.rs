use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub search: SearchConfig,
    pub vector: VectorConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    /// Connection URL with a `{tenant}` placeholder, e.g.
    /// `postgres://ingest@db.internal/docs_{tenant}`. Tenant databases are
    /// provisioned externally; this crate only connects.
    pub url: String,
    /// Optional read-replica URL (same `{tenant}` placeholder). Preparation
    /// reads go here when set.
    #[serde(default)]
    pub readonly_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub url: String,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_index_prefix() -> String {
    "docs".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    pub url: String,
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
    /// Environment variable holding the API key, if the deployment needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_namespace_prefix() -> String {
    "chunks".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Full embeddings endpoint URL (OpenAI-compatible shape).
    pub url: String,
    pub model: String,
    pub dims: usize,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Re-embed only changed chunks when deterministic chunk IDs allow it.
    #[serde(default = "default_true")]
    pub incremental: bool,
    /// Above this chunk count, a full reindex deletes once and upserts in
    /// batches instead of one atomic replace call.
    #[serde(default = "default_max_atomic_chunks")]
    pub max_atomic_chunks: usize,
    /// Upsert batch size on the batched full-reindex path.
    #[serde(default = "default_chunk_upsert_batch")]
    pub chunk_upsert_batch: usize,
    /// Simultaneous in-flight full-reindex document writes to the vector
    /// store.
    #[serde(default = "default_vector_concurrency")]
    pub vector_concurrency: usize,
    /// Batch deletion: documents per sub-batch.
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    /// Batch deletion: simultaneous in-flight deletions.
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            incremental: true,
            max_atomic_chunks: default_max_atomic_chunks(),
            chunk_upsert_batch: default_chunk_upsert_batch(),
            vector_concurrency: default_vector_concurrency(),
            delete_batch_size: default_delete_batch_size(),
            delete_concurrency: default_delete_concurrency(),
            scoring: ScoringConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_atomic_chunks() -> usize {
    256
}
fn default_chunk_upsert_batch() -> usize {
    128
}
fn default_vector_concurrency() -> usize {
    4
}
fn default_delete_batch_size() -> usize {
    50
}
fn default_delete_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_referrer_weight")]
    pub referrer_weight: f64,
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            relevance_weight: default_relevance_weight(),
            recency_weight: default_recency_weight(),
            referrer_weight: default_referrer_weight(),
            recency_half_life_days: default_recency_half_life_days(),
        }
    }
}

fn default_relevance_weight() -> f64 {
    1.0
}
fn default_recency_weight() -> f64 {
    0.3
}
fn default_referrer_weight() -> f64 {
    0.2
}
fn default_recency_half_life_days() -> f64 {
    90.0
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !config.postgres.url.contains("{tenant}") {
        anyhow::bail!("postgres.url must contain a {{tenant}} placeholder");
    }
    if let Some(ref readonly) = config.postgres.readonly_url {
        if !readonly.contains("{tenant}") {
            anyhow::bail!("postgres.readonly_url must contain a {{tenant}} placeholder");
        }
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.indexing.max_atomic_chunks == 0 {
        anyhow::bail!("indexing.max_atomic_chunks must be > 0");
    }
    if config.indexing.chunk_upsert_batch == 0 {
        anyhow::bail!("indexing.chunk_upsert_batch must be > 0");
    }
    if config.indexing.delete_batch_size == 0 || config.indexing.delete_concurrency == 0 {
        anyhow::bail!("indexing.delete_batch_size and delete_concurrency must be > 0");
    }
    if config.indexing.vector_concurrency == 0 {
        anyhow::bail!("indexing.vector_concurrency must be > 0");
    }

    Ok(config)
}
