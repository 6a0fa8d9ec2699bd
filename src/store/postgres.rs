//! PostgreSQL implementation of [`DocumentStore`].
//!
//! Batch writes run in one transaction that first takes
//! `pg_advisory_xact_lock` on every document that will be touched — both
//! documents written directly and documents receiving a referrer update —
//! in a single globally sorted ID order, so concurrent indexing workers
//! with overlapping document sets cannot deadlock. Upserts go through
//! `UNNEST` so a whole batch is one statement.
//!
//! Reads used during batch preparation (`content_hash`, `get_document`,
//! `referrer_targets`, `find_referrers`) run against a read-only pool.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;

use crate::hash::advisory_lock_key;
use crate::models::{Document, DocumentTouch, Metadata, RefCountMap, ReferrerUpdate};

use super::{DocumentStore, ReferrerTarget};

pub struct PgDocumentStore {
    pool: PgPool,
    readonly: PgPool,
}

impl PgDocumentStore {
    /// Build a store over a write pool and a read-only pool. Pass the same
    /// pool twice when no replica is configured.
    pub fn new(pool: PgPool, readonly: PgPool) -> Self {
        Self { pool, readonly }
    }

    async fn acquire_locks<'t, 'i>(
        tx: &mut sqlx::Transaction<'t, sqlx::Postgres>,
        document_ids: impl IntoIterator<Item = &'i str>,
    ) -> Result<()> {
        // Sorted, deduplicated lock order across all concurrent writers.
        let ordered: BTreeSet<&str> = document_ids.into_iter().collect();
        for id in ordered {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(advisory_lock_key(id))
                .execute(&mut **tx)
                .await
                .with_context(|| format!("acquiring advisory lock for document {}", id))?;
        }
        Ok(())
    }

    async fn apply_referrer_updates(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        updates: &[ReferrerUpdate],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        // Consistent row-update order between concurrent batches.
        let mut updates: Vec<&ReferrerUpdate> = updates.iter().collect();
        updates.sort_by(|a, b| a.reference_id.cmp(&b.reference_id));

        let reference_ids: Vec<String> = updates.iter().map(|u| u.reference_id.clone()).collect();
        let referrers: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| serde_json::to_value(&u.referrers))
            .collect::<Result<_, _>>()?;
        let scores: Vec<f64> = updates.iter().map(|u| u.referrer_score).collect();

        sqlx::query(
            r#"
            UPDATE documents AS d
            SET referrers = u.referrers,
                referrer_score = u.referrer_score
            FROM UNNEST($1::text[], $2::jsonb[], $3::float8[])
                AS u(reference_id, referrers, referrer_score)
            WHERE d.reference_id = u.reference_id
            "#,
        )
        .bind(&reference_ids)
        .bind(&referrers)
        .bind(&scores)
        .execute(&mut **tx)
        .await
        .context("applying referrer updates")?;

        Ok(())
    }

    async fn upsert_permissions(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        rows: &[(String, String, Vec<String>)],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let document_ids: Vec<String> = rows.iter().map(|(id, _, _)| id.clone()).collect();
        let policies: Vec<String> = rows.iter().map(|(_, p, _)| p.clone()).collect();
        let tokens: Vec<serde_json::Value> = rows
            .iter()
            .map(|(_, _, t)| serde_json::to_value(t))
            .collect::<Result<_, _>>()?;

        sqlx::query(
            r#"
            INSERT INTO document_permissions (document_id, policy, allowed_tokens)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::jsonb[])
            ON CONFLICT (document_id) DO UPDATE SET
                policy = EXCLUDED.policy,
                allowed_tokens = EXCLUDED.allowed_tokens
            "#,
        )
        .bind(&document_ids)
        .bind(&policies)
        .bind(&tokens)
        .execute(&mut **tx)
        .await
        .context("upserting document permissions")?;

        Ok(())
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document> {
    let metadata: Json<Metadata> = row.try_get("metadata")?;
    let referenced_docs: Json<RefCountMap> = row.try_get("referenced_docs")?;
    let referrers: Json<RefCountMap> = row.try_get("referrers")?;
    let allowed_tokens: Option<Json<Vec<String>>> = row.try_get("allowed_tokens")?;

    Ok(Document {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        metadata: metadata.0,
        source: row.try_get("source")?,
        source_created_at: row.try_get::<Option<DateTime<Utc>>, _>("source_created_at")?,
        source_updated_at: row.try_get::<Option<DateTime<Utc>>, _>("source_updated_at")?,
        reference_id: row.try_get("reference_id")?,
        referenced_docs: referenced_docs.0,
        referrers: referrers.0,
        referrer_score: row.try_get("referrer_score")?,
        permission_policy: row
            .try_get::<Option<String>, _>("policy")?
            .unwrap_or_default(),
        permission_allowed_tokens: allowed_tokens.map(|t| t.0).unwrap_or_default(),
        last_seen_backfill_id: row.try_get("last_seen_backfill_id")?,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn content_hash(&self, document_id: &str) -> Result<Option<String>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.readonly)
                .await?;
        Ok(hash)
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT d.id, d.content, d.content_hash, d.metadata, d.source,
                   d.source_created_at, d.source_updated_at, d.reference_id,
                   d.referenced_docs, d.referrers, d.referrer_score,
                   d.last_seen_backfill_id, p.policy, p.allowed_tokens
            FROM documents d
            LEFT JOIN document_permissions p ON p.document_id = d.id
            WHERE d.id = $1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.readonly)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn referrer_targets(&self, reference_ids: &[String]) -> Result<Vec<ReferrerTarget>> {
        if reference_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT id, reference_id, referrers FROM documents WHERE reference_id = ANY($1)",
        )
        .bind(reference_ids)
        .fetch_all(&self.readonly)
        .await?;

        rows.iter()
            .map(|row| {
                let referrers: Json<RefCountMap> = row.try_get("referrers")?;
                Ok(ReferrerTarget {
                    document_id: row.try_get("id")?,
                    reference_id: row.try_get("reference_id")?,
                    referrers: referrers.0,
                })
            })
            .collect()
    }

    async fn find_referrers(&self, reference_id: &str) -> Result<RefCountMap> {
        // Containment query accelerated by the GIN index on referenced_docs.
        let rows = sqlx::query(
            r#"
            SELECT reference_id, (referenced_docs ->> $1)::bigint AS count
            FROM documents
            WHERE referenced_docs ? $1
            "#,
        )
        .bind(reference_id)
        .fetch_all(&self.readonly)
        .await?;

        let mut referrers = RefCountMap::new();
        for row in rows {
            let source_ref: String = row.try_get("reference_id")?;
            let count: Option<i64> = row.try_get("count")?;
            referrers.insert(source_ref, count.unwrap_or(0));
        }
        Ok(referrers)
    }

    async fn write_batch(
        &self,
        documents: &[Document],
        touches: &[DocumentTouch],
        referrer_updates: &[ReferrerUpdate],
    ) -> Result<()> {
        if documents.is_empty() && touches.is_empty() && referrer_updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        Self::acquire_locks(
            &mut tx,
            documents
                .iter()
                .map(|d| d.id.as_str())
                .chain(touches.iter().map(|t| t.document_id.as_str()))
                .chain(referrer_updates.iter().map(|u| u.document_id.as_str())),
        )
        .await?;

        if !documents.is_empty() {
            let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
            let contents: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
            let hashes: Vec<String> = documents.iter().map(|d| d.content_hash.clone()).collect();
            let metadata: Vec<serde_json::Value> = documents
                .iter()
                .map(|d| serde_json::to_value(&d.metadata))
                .collect::<Result<_, _>>()?;
            let sources: Vec<String> = documents.iter().map(|d| d.source.clone()).collect();
            let created: Vec<Option<DateTime<Utc>>> =
                documents.iter().map(|d| d.source_created_at).collect();
            let updated: Vec<Option<DateTime<Utc>>> =
                documents.iter().map(|d| d.source_updated_at).collect();
            let reference_ids: Vec<String> =
                documents.iter().map(|d| d.reference_id.clone()).collect();
            let referenced: Vec<serde_json::Value> = documents
                .iter()
                .map(|d| serde_json::to_value(&d.referenced_docs))
                .collect::<Result<_, _>>()?;
            let referrers: Vec<serde_json::Value> = documents
                .iter()
                .map(|d| serde_json::to_value(&d.referrers))
                .collect::<Result<_, _>>()?;
            let scores: Vec<f64> = documents.iter().map(|d| d.referrer_score).collect();
            let backfills: Vec<Option<String>> = documents
                .iter()
                .map(|d| d.last_seen_backfill_id.clone())
                .collect();

            sqlx::query(
                r#"
                INSERT INTO documents
                    (id, content, content_hash, metadata, source,
                     source_created_at, source_updated_at, reference_id,
                     referenced_docs, referrers, referrer_score,
                     last_seen_backfill_id)
                SELECT * FROM UNNEST(
                    $1::text[], $2::text[], $3::text[], $4::jsonb[], $5::text[],
                    $6::timestamptz[], $7::timestamptz[], $8::text[],
                    $9::jsonb[], $10::jsonb[], $11::float8[], $12::text[])
                ON CONFLICT (id) DO UPDATE SET
                    content = EXCLUDED.content,
                    content_hash = EXCLUDED.content_hash,
                    metadata = EXCLUDED.metadata,
                    source = EXCLUDED.source,
                    source_created_at = EXCLUDED.source_created_at,
                    source_updated_at = EXCLUDED.source_updated_at,
                    reference_id = EXCLUDED.reference_id,
                    referenced_docs = EXCLUDED.referenced_docs,
                    referrers = EXCLUDED.referrers,
                    referrer_score = EXCLUDED.referrer_score,
                    last_seen_backfill_id = COALESCE(
                        EXCLUDED.last_seen_backfill_id,
                        documents.last_seen_backfill_id)
                "#,
            )
            .bind(&ids)
            .bind(&contents)
            .bind(&hashes)
            .bind(&metadata)
            .bind(&sources)
            .bind(&created)
            .bind(&updated)
            .bind(&reference_ids)
            .bind(&referenced)
            .bind(&referrers)
            .bind(&scores)
            .bind(&backfills)
            .execute(&mut *tx)
            .await
            .context("upserting documents batch")?;
        }

        // Permission rows for written documents and touched (skipped) ones.
        let permission_rows: Vec<(String, String, Vec<String>)> = documents
            .iter()
            .map(|d| {
                (
                    d.id.clone(),
                    d.permission_policy.clone(),
                    d.permission_allowed_tokens.clone(),
                )
            })
            .chain(touches.iter().map(|t| {
                (
                    t.document_id.clone(),
                    t.permission_policy.clone(),
                    t.permission_allowed_tokens.clone(),
                )
            }))
            .collect();
        Self::upsert_permissions(&mut tx, &permission_rows).await?;

        // Backfill markers for skipped-but-seen documents.
        let marked: Vec<&DocumentTouch> =
            touches.iter().filter(|t| t.backfill_id.is_some()).collect();
        if !marked.is_empty() {
            let ids: Vec<String> = marked.iter().map(|t| t.document_id.clone()).collect();
            let backfills: Vec<String> = marked
                .iter()
                .filter_map(|t| t.backfill_id.clone())
                .collect();
            sqlx::query(
                r#"
                UPDATE documents AS d
                SET last_seen_backfill_id = u.backfill_id
                FROM UNNEST($1::text[], $2::text[]) AS u(document_id, backfill_id)
                WHERE d.id = u.document_id
                "#,
            )
            .bind(&ids)
            .bind(&backfills)
            .execute(&mut *tx)
            .await
            .context("stamping backfill markers")?;
        }

        Self::apply_referrer_updates(&mut tx, referrer_updates).await?;

        tx.commit().await.context("committing batch write")?;
        Ok(())
    }

    async fn delete_document(
        &self,
        document_id: &str,
        referrer_updates: &[ReferrerUpdate],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        Self::acquire_locks(
            &mut tx,
            std::iter::once(document_id)
                .chain(referrer_updates.iter().map(|u| u.document_id.as_str())),
        )
        .await?;

        Self::apply_referrer_updates(&mut tx, referrer_updates).await?;

        sqlx::query("DELETE FROM document_permissions WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("committing document delete")?;
        Ok(result.rows_affected() > 0)
    }
}
