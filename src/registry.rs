//! Tenant store registry.
//!
//! One registry per process, created explicitly and passed where needed —
//! no module-level globals — with an explicit `cleanup` so tests and
//! multi-runtime embedders can tear connections down deterministically.
//!
//! The registry is the only place tenant identifiers meet backend naming:
//! it validates the tenant ID once, substitutes it into the connection URL,
//! index name, and namespace, and hands out a [`TenantStores`] whose
//! handles are scoped to that tenant by construction. Code holding a
//! handle cannot address another tenant.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;
use crate::store::opensearch::OpenSearchIndex;
use crate::store::postgres::PgDocumentStore;
use crate::store::turbopuffer::TurbopufferNamespace;
use crate::store::TenantStores;

pub struct StoreRegistry {
    config: Config,
    tenants: RwLock<HashMap<String, Arc<TenantStores>>>,
    pools: RwLock<Vec<PgPool>>,
}

impl StoreRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tenants: RwLock::new(HashMap::new()),
            pools: RwLock::new(Vec::new()),
        }
    }

    /// Get (or lazily build) the store handles for a tenant.
    ///
    /// Builds per-tenant connection pools on first use; subsequent calls
    /// return the cached handles.
    pub async fn tenant(&self, tenant_id: &str) -> Result<Arc<TenantStores>> {
        validate_tenant_id(tenant_id)?;

        {
            let tenants = self.tenants.read().await;
            if let Some(stores) = tenants.get(tenant_id) {
                return Ok(stores.clone());
            }
        }

        let mut tenants = self.tenants.write().await;
        // Re-check under the write lock; another task may have built it.
        if let Some(stores) = tenants.get(tenant_id) {
            return Ok(stores.clone());
        }

        let url = self.config.postgres.url.replace("{tenant}", tenant_id);
        let pool = PgPoolOptions::new()
            .max_connections(self.config.postgres.max_connections)
            .connect(&url)
            .await
            .with_context(|| format!("connecting to relational store for tenant {}", tenant_id))?;

        let readonly = match &self.config.postgres.readonly_url {
            Some(readonly_url) => {
                let url = readonly_url.replace("{tenant}", tenant_id);
                PgPoolOptions::new()
                    .max_connections(self.config.postgres.max_connections)
                    .connect(&url)
                    .await
                    .with_context(|| {
                        format!("connecting to read replica for tenant {}", tenant_id)
                    })?
            }
            None => pool.clone(),
        };

        {
            let mut pools = self.pools.write().await;
            pools.push(pool.clone());
            if self.config.postgres.readonly_url.is_some() {
                pools.push(readonly.clone());
            }
        }

        let stores = Arc::new(TenantStores::new(
            tenant_id,
            Arc::new(PgDocumentStore::new(pool, readonly)),
            Arc::new(OpenSearchIndex::for_tenant(&self.config.search, tenant_id)?),
            Arc::new(TurbopufferNamespace::for_tenant(
                &self.config.vector,
                tenant_id,
            )?),
        ));
        tenants.insert(tenant_id.to_string(), stores.clone());
        info!(tenant = tenant_id, "tenant store handles created");
        Ok(stores)
    }

    /// Close every pool and drop all cached handles.
    pub async fn cleanup(&self) {
        let mut tenants = self.tenants.write().await;
        tenants.clear();
        let mut pools = self.pools.write().await;
        for pool in pools.drain(..) {
            pool.close().await;
        }
        info!("store registry cleaned up");
    }
}

/// Tenant IDs flow into connection URLs, index names, and namespaces, so
/// only a conservative character set is accepted.
fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() || tenant_id.len() > 64 {
        bail!("tenant id must be 1-64 characters");
    }
    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        bail!(
            "tenant id '{}' may only contain lowercase letters, digits, '-', '_'",
            tenant_id
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tenant_ids() {
        assert!(validate_tenant_id("acme").is_ok());
        assert!(validate_tenant_id("acme-corp_2").is_ok());
    }

    #[test]
    fn test_invalid_tenant_ids() {
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("Acme").is_err());
        assert!(validate_tenant_id("a b").is_err());
        assert!(validate_tenant_id("a/b").is_err());
        assert!(validate_tenant_id(&"x".repeat(65)).is_err());
    }
}
