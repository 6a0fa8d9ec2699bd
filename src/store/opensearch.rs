//! OpenSearch implementation of [`SearchIndex`].
//!
//! One handle per tenant: the index name is baked in at construction, so no
//! method can address another tenant's index. Writes use the `_bulk` NDJSON
//! endpoint; a bulk response reporting per-item errors raises, because the
//! caller cannot assume partial success.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::SearchConfig;
use crate::models::{Document, ReferrerUpdate};

use super::SearchIndex;

pub struct OpenSearchIndex {
    client: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl OpenSearchIndex {
    /// Build the tenant-scoped handle. The index name is derived from the
    /// configured prefix and the tenant ID once, here, and nowhere else.
    pub fn for_tenant(config: &SearchConfig, tenant_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: format!("{}-{}", config.index_prefix, tenant_id),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    /// POST an NDJSON body to `_bulk` and fail on any per-item error.
    async fn send_bulk(&self, body: String, item_count: usize) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("sending bulk request to search index")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Search index bulk request failed {}: {}", status, body_text);
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .context("parsing bulk response from search index")?;

        if parsed.get("errors").and_then(|e| e.as_bool()) == Some(true) {
            let reasons: Vec<String> = parsed
                .get("items")
                .and_then(|items| items.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            item.as_object()?
                                .values()
                                .next()?
                                .get("error")
                                .map(|e| e.to_string())
                        })
                        .take(3)
                        .collect()
                })
                .unwrap_or_default();
            bail!(
                "Search index bulk write reported item errors (first {}): {}",
                reasons.len(),
                reasons.join("; ")
            );
        }

        debug!(index = %self.index, items = item_count, "bulk write acknowledged");
        Ok(())
    }
}

fn search_body(doc: &Document) -> serde_json::Value {
    json!({
        "content": doc.content,
        "content_hash": doc.content_hash,
        "metadata": doc.metadata,
        "source": doc.source,
        "source_created_at": doc.source_created_at,
        "source_updated_at": doc.source_updated_at,
        "reference_id": doc.reference_id,
        "referenced_docs": doc.referenced_docs,
        "referrers": doc.referrers,
        "referrer_score": doc.referrer_score,
        "permission_policy": doc.permission_policy,
        "permission_allowed_tokens": doc.permission_allowed_tokens,
    })
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn bulk_index(&self, documents: &[Document]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for doc in documents {
            body.push_str(&json!({ "index": { "_index": self.index, "_id": doc.id } }).to_string());
            body.push('\n');
            body.push_str(&search_body(doc).to_string());
            body.push('\n');
        }

        self.send_bulk(body, documents.len()).await
    }

    async fn bulk_update_scores(&self, updates: &[ReferrerUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for update in updates {
            body.push_str(
                &json!({ "update": { "_index": self.index, "_id": update.document_id } })
                    .to_string(),
            );
            body.push('\n');
            body.push_str(
                &json!({
                    "doc": {
                        "referrers": update.referrers,
                        "referrer_score": update.referrer_score,
                    },
                    "doc_as_upsert": true,
                })
                .to_string(),
            );
            body.push('\n');
        }

        self.send_bulk(body, updates.len()).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/{}/_doc/{}", self.index, document_id),
            )
            .send()
            .await
            .context("deleting document from search index")?;

        let status = response.status();
        // 404 means the document was never indexed; deletion is idempotent.
        if !status.is_success() && status.as_u16() != 404 {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Search index delete failed {}: {}", status, body_text);
        }
        Ok(())
    }
}
