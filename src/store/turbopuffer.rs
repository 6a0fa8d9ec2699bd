//! Turbopuffer implementation of [`VectorStore`].
//!
//! One handle per tenant namespace, namespace baked in at construction.
//! Writes (`upsert_rows`, `deletes`, `delete_by_filter`) go through the
//! namespace write endpoint; a combined delete-by-filter + upsert lands in a
//! single call so a full reindex replaces a document's chunk set atomically.
//!
//! The chunk-hash lookup used for incremental diffing is an idempotent read
//! and retries transient failures (connection errors, 429, 5xx) with the
//! same exponential backoff the embedding client uses. Writes are never
//! auto-retried; the caller decides whether to retry a whole batch.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::VectorConfig;
use crate::models::ChunkRow;

use super::VectorStore;

/// Page size for the chunk-hash query.
const QUERY_PAGE_SIZE: usize = 500;

pub struct TurbopufferNamespace {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl TurbopufferNamespace {
    /// Build the tenant-scoped handle; the namespace is derived from the
    /// configured prefix and the tenant ID exactly once.
    pub fn for_tenant(config: &VectorConfig, tenant_id: &str) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => bail!("{} environment variable not set", var),
            },
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            namespace: format!("{}-{}", config.namespace_prefix, tenant_id),
            api_key,
            max_retries: config.max_retries,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        request
    }

    /// Issue a namespace write. No retry: writes are not idempotent from the
    /// caller's point of view and a failed batch is retried wholesale by the
    /// ingestion job, not here.
    async fn write(&self, body: serde_json::Value) -> Result<()> {
        let response = self
            .post(&format!("/v1/namespaces/{}", self.namespace))
            .json(&body)
            .send()
            .await
            .context("sending write to vector store")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Vector store write failed {}: {}", status, body_text);
        }
        Ok(())
    }

    /// Issue a query with retry/backoff for transient failures.
    async fn query(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let response = self
                .post(&format!("/v1/namespaces/{}/query", self.namespace))
                .json(body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .context("parsing vector store query response");
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Vector store query error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Vector store query failed {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Vector store query failed after retries")))
    }
}

fn row_json(row: &ChunkRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "vector": row.embedding,
        "attributes": {
            "document_id": row.document_id,
            "content": row.content,
            "content_hash": row.content_hash,
            "permission_policy": row.permission_policy,
            "permission_allowed_tokens": row.permission_allowed_tokens,
        },
    })
}

#[async_trait]
impl VectorStore for TurbopufferNamespace {
    async fn chunk_hashes(&self, document_id: &str) -> Result<HashMap<String, String>> {
        let mut hashes = HashMap::new();
        let mut last_id: Option<String> = None;

        // Paginate by id rank so large documents never need one huge read.
        loop {
            let cursor_before = last_id.clone();
            let filters = match &last_id {
                None => json!(["document_id", "Eq", document_id]),
                Some(cursor) => json!([
                    "And",
                    [
                        ["document_id", "Eq", document_id],
                        ["id", "Gt", cursor],
                    ]
                ]),
            };
            let body = json!({
                "filters": filters,
                "rank_by": ["id", "asc"],
                "include_attributes": ["content_hash"],
                "top_k": QUERY_PAGE_SIZE,
            });

            let parsed = self.query(&body).await?;
            let rows = parsed
                .get("rows")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let Some(id) = row.get("id").and_then(|i| i.as_str()) else {
                    continue;
                };
                let hash = row
                    .get("attributes")
                    .and_then(|a| a.get("content_hash"))
                    .and_then(|h| h.as_str())
                    .unwrap_or_default();
                hashes.insert(id.to_string(), hash.to_string());
                last_id = Some(id.to_string());
            }

            if rows.len() < QUERY_PAGE_SIZE || last_id == cursor_before {
                break;
            }
        }

        debug!(
            namespace = %self.namespace,
            document_id,
            chunks = hashes.len(),
            "fetched existing chunk hashes"
        );
        Ok(hashes)
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        self.write(json!({ "deletes": chunk_ids })).await
    }

    async fn upsert_chunks(&self, rows: &[ChunkRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows: Vec<serde_json::Value> = rows.iter().map(row_json).collect();
        self.write(json!({ "upsert_rows": rows })).await
    }

    async fn replace_document_chunks(&self, document_id: &str, rows: &[ChunkRow]) -> Result<()> {
        let rows: Vec<serde_json::Value> = rows.iter().map(row_json).collect();
        self.write(json!({
            "delete_by_filter": ["document_id", "Eq", document_id],
            "upsert_rows": rows,
        }))
        .await
    }

    async fn purge_document(&self, document_id: &str) -> Result<()> {
        self.write(json!({
            "delete_by_filter": ["document_id", "Eq", document_id],
        }))
        .await
    }
}
