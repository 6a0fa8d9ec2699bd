use anyhow::Result;
use sqlx::postgres::PgPool;

/// Apply the tenant database schema. Idempotent; safe to run on every
/// startup against an already-migrated database.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // Documents table. referenced_docs/referrers are JSONB maps of
    // reference_id -> occurrence count; the GIN index below serves the
    // reverse-referrer containment lookup.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            source TEXT NOT NULL,
            source_created_at TIMESTAMPTZ,
            source_updated_at TIMESTAMPTZ,
            reference_id TEXT NOT NULL,
            referenced_docs JSONB NOT NULL DEFAULT '{}',
            referrers JSONB NOT NULL DEFAULT '{}',
            referrer_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            last_seen_backfill_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_permissions (
            document_id TEXT PRIMARY KEY
                REFERENCES documents(id) ON DELETE CASCADE,
            policy TEXT NOT NULL,
            allowed_tokens JSONB NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_reference_id ON documents(reference_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_referenced_docs \
         ON documents USING GIN (referenced_docs)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_backfill \
         ON documents(last_seen_backfill_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
