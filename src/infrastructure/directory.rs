// Directory store - the persistent tenant -> shard mapping in the global
// database. Source of truth for routing; everything above it is cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::ShardStatus;
use crate::error::{RouterError, RouterResult};
use crate::infrastructure::pool_set::Dialect;
use crate::infrastructure::shard_registry::ShardId;

pub type TenantId = i64;

/// One row of `tenant_shard_mapping`. `created_at` is epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantShardMapping {
    pub tenant_id: TenantId,
    pub shard_id: ShardId,
    pub region: Option<String>,
    pub status: ShardStatus,
    pub created_at: i64,
}

impl TenantShardMapping {
    pub fn is_active(&self) -> bool {
        self.status == ShardStatus::Active
    }
}

/// Partial update of a mapping row. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct MappingChange {
    pub shard_id: Option<ShardId>,
    pub region: Option<String>,
    pub status: Option<ShardStatus>,
}

impl MappingChange {
    pub fn move_to(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: Some(shard_id.into()),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_status(mut self, status: ShardStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.shard_id.is_none() && self.region.is_none() && self.status.is_none()
    }
}

/// CRUD over the directory table. Trait so the lookup service and tenant
/// iterator can run against a test double.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find(&self, tenant_id: TenantId) -> RouterResult<Option<TenantShardMapping>>;

    /// Inserts a new mapping. Fails `AlreadyExists` when a row is present.
    async fn create(
        &self,
        tenant_id: TenantId,
        shard_id: &str,
        region: Option<&str>,
    ) -> RouterResult<TenantShardMapping>;

    /// Conditional update; returns `false` when no row existed.
    async fn update(&self, tenant_id: TenantId, change: MappingChange) -> RouterResult<bool>;

    /// Keyset page ordered by tenant id; `cursor` is the last id of the
    /// previous page.
    async fn iterate_all(
        &self,
        cursor: Option<TenantId>,
        limit: u32,
    ) -> RouterResult<Vec<TenantShardMapping>>;

    async fn iterate_by_shard(
        &self,
        shard_id: &str,
        cursor: Option<TenantId>,
        limit: u32,
    ) -> RouterResult<Vec<TenantShardMapping>>;
}

/// Directory store over the global database pool.
pub struct SqlDirectoryStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlDirectoryStore {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// Create the mapping table and its secondary indexes if missing.
    pub async fn ensure_schema(&self) -> RouterResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tenant_shard_mapping (
                tenant_id BIGINT PRIMARY KEY,
                shard_id VARCHAR(255) NOT NULL,
                region VARCHAR(255),
                shard_status VARCHAR(50) NOT NULL DEFAULT 'ACTIVE',
                created_at BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for (name, column) in [
            ("idx_tenant_shard_mapping_shard_id", "shard_id"),
            ("idx_tenant_shard_mapping_status", "shard_status"),
            ("idx_tenant_shard_mapping_region", "region"),
        ] {
            self.create_index(name, column).await?;
        }

        info!("Directory schema ready ({:?})", self.dialect);
        Ok(())
    }

    async fn create_index(&self, name: &str, column: &str) -> RouterResult<()> {
        match self.dialect {
            Dialect::Postgres | Dialect::Sqlite => {
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {} ON tenant_shard_mapping({})",
                    name, column
                ))
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            // MySQL has no IF NOT EXISTS for indexes; a duplicate-name
            // error on re-run is expected and ignored.
            Dialect::MySql => {
                let result = sqlx::query(&format!(
                    "CREATE INDEX {} ON tenant_shard_mapping({})",
                    name, column
                ))
                .execute(&self.pool)
                .await;
                match result {
                    Ok(_) => Ok(()),
                    Err(sqlx::Error::Database(db)) if db.message().contains("Duplicate") => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn row_to_mapping(row: &sqlx::any::AnyRow) -> RouterResult<TenantShardMapping> {
        let status_raw: String = row.try_get("shard_status").map_err(sqlx_err)?;
        let status = ShardStatus::parse(&status_raw).ok_or_else(|| {
            RouterError::Configuration(format!("Unknown shard_status '{}' in directory", status_raw))
        })?;
        Ok(TenantShardMapping {
            tenant_id: row.try_get("tenant_id").map_err(sqlx_err)?,
            shard_id: row.try_get("shard_id").map_err(sqlx_err)?,
            region: row.try_get("region").map_err(sqlx_err)?,
            status,
            created_at: row.try_get("created_at").map_err(sqlx_err)?,
        })
    }
}

fn sqlx_err(e: sqlx::Error) -> RouterError {
    e.into()
}

#[async_trait]
impl DirectoryStore for SqlDirectoryStore {
    async fn find(&self, tenant_id: TenantId) -> RouterResult<Option<TenantShardMapping>> {
        let sql = self.dialect.rewrite(
            "SELECT tenant_id, shard_id, region, shard_status, created_at
             FROM tenant_shard_mapping WHERE tenant_id = ?",
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn create(
        &self,
        tenant_id: TenantId,
        shard_id: &str,
        region: Option<&str>,
    ) -> RouterResult<TenantShardMapping> {
        let created_at = chrono::Utc::now().timestamp_millis();
        let sql = self.dialect.rewrite(
            "INSERT INTO tenant_shard_mapping
                 (tenant_id, shard_id, region, shard_status, created_at)
             VALUES (?, ?, ?, ?, ?)",
        );
        let result = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(shard_id)
            .bind(region)
            .bind(ShardStatus::Active.as_str())
            .bind(created_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(TenantShardMapping {
                tenant_id,
                shard_id: shard_id.to_string(),
                region: region.map(str::to_string),
                status: ShardStatus::Active,
                created_at,
            }),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation()
                    || db.message().contains("UNIQUE")
                    || db.message().contains("Duplicate entry") =>
            {
                Err(RouterError::AlreadyExists(tenant_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, tenant_id: TenantId, change: MappingChange) -> RouterResult<bool> {
        if change.is_empty() {
            return Err(RouterError::DirectoryWriteConflict(
                "update carries no changes".to_string(),
            ));
        }

        let mut sets = Vec::new();
        if change.shard_id.is_some() {
            sets.push("shard_id = ?");
        }
        if change.region.is_some() {
            sets.push("region = ?");
        }
        if change.status.is_some() {
            sets.push("shard_status = ?");
        }
        let sql = self.dialect.rewrite(&format!(
            "UPDATE tenant_shard_mapping SET {} WHERE tenant_id = ?",
            sets.join(", ")
        ));

        let mut query = sqlx::query(&sql);
        if let Some(shard_id) = &change.shard_id {
            query = query.bind(shard_id.clone());
        }
        if let Some(region) = &change.region {
            query = query.bind(region.clone());
        }
        if let Some(status) = change.status {
            query = query.bind(status.as_str());
        }
        let result = query.bind(tenant_id).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn iterate_all(
        &self,
        cursor: Option<TenantId>,
        limit: u32,
    ) -> RouterResult<Vec<TenantShardMapping>> {
        let sql = self.dialect.rewrite(
            "SELECT tenant_id, shard_id, region, shard_status, created_at
             FROM tenant_shard_mapping WHERE tenant_id > ?
             ORDER BY tenant_id LIMIT ?",
        );
        let rows = sqlx::query(&sql)
            .bind(cursor.unwrap_or(i64::MIN))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_mapping).collect()
    }

    async fn iterate_by_shard(
        &self,
        shard_id: &str,
        cursor: Option<TenantId>,
        limit: u32,
    ) -> RouterResult<Vec<TenantShardMapping>> {
        let sql = self.dialect.rewrite(
            "SELECT tenant_id, shard_id, region, shard_status, created_at
             FROM tenant_shard_mapping WHERE shard_id = ? AND tenant_id > ?
             ORDER BY tenant_id LIMIT ?",
        );
        let rows = sqlx::query(&sql)
            .bind(shard_id)
            .bind(cursor.unwrap_or(i64::MIN))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_mapping).collect()
    }
}

/// In-memory directory for embedded and test use.
#[derive(Debug, Default)]
pub struct MemoryDirectoryStore {
    rows: RwLock<BTreeMap<TenantId, TenantShardMapping>>,
}

impl MemoryDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectoryStore {
    async fn find(&self, tenant_id: TenantId) -> RouterResult<Option<TenantShardMapping>> {
        Ok(self.rows.read().await.get(&tenant_id).cloned())
    }

    async fn create(
        &self,
        tenant_id: TenantId,
        shard_id: &str,
        region: Option<&str>,
    ) -> RouterResult<TenantShardMapping> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&tenant_id) {
            return Err(RouterError::AlreadyExists(tenant_id));
        }
        let mapping = TenantShardMapping {
            tenant_id,
            shard_id: shard_id.to_string(),
            region: region.map(str::to_string),
            status: ShardStatus::Active,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        rows.insert(tenant_id, mapping.clone());
        Ok(mapping)
    }

    async fn update(&self, tenant_id: TenantId, change: MappingChange) -> RouterResult<bool> {
        if change.is_empty() {
            return Err(RouterError::DirectoryWriteConflict(
                "update carries no changes".to_string(),
            ));
        }
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(&tenant_id) else {
            return Ok(false);
        };
        if let Some(shard_id) = change.shard_id {
            row.shard_id = shard_id;
        }
        if let Some(region) = change.region {
            row.region = Some(region);
        }
        if let Some(status) = change.status {
            row.status = status;
        }
        Ok(true)
    }

    async fn iterate_all(
        &self,
        cursor: Option<TenantId>,
        limit: u32,
    ) -> RouterResult<Vec<TenantShardMapping>> {
        let rows = self.rows.read().await;
        let start = cursor.map(|c| c + 1).unwrap_or(i64::MIN);
        Ok(rows.range(start..).take(limit as usize).map(|(_, m)| m.clone()).collect())
    }

    async fn iterate_by_shard(
        &self,
        shard_id: &str,
        cursor: Option<TenantId>,
        limit: u32,
    ) -> RouterResult<Vec<TenantShardMapping>> {
        let rows = self.rows.read().await;
        let start = cursor.map(|c| c + 1).unwrap_or(i64::MIN);
        Ok(rows
            .range(start..)
            .filter(|(_, m)| m.shard_id == shard_id)
            .take(limit as usize)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::pool_set::ensure_any_drivers;
    use sqlx::any::AnyPoolOptions;

    async fn sqlite_store() -> SqlDirectoryStore {
        ensure_any_drivers();
        // A single connection keeps every statement on the same :memory: db.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlDirectoryStore::new(pool, Dialect::Sqlite);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_find_roundtrip() {
        let store = sqlite_store().await;
        let created = store.create(1001, "shard1", Some("us-east")).await.unwrap();
        assert_eq!(created.status, ShardStatus::Active);

        let found = store.find(1001).await.unwrap().unwrap();
        assert_eq!(found, created);
        assert!(store.find(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_twice_fails_already_exists() {
        let store = sqlite_store().await;
        store.create(1001, "shard1", None).await.unwrap();
        let err = store.create(1001, "shard2", None).await.unwrap_err();
        assert_eq!(err.kind(), "AlreadyExists");
    }

    #[tokio::test]
    async fn update_moves_tenant_and_reports_missing_rows() {
        let store = sqlite_store().await;
        store.create(1001, "shard1", Some("us-east")).await.unwrap();

        let changed = store
            .update(1001, MappingChange::move_to("shard2").with_region("us-west"))
            .await
            .unwrap();
        assert!(changed);

        let mapping = store.find(1001).await.unwrap().unwrap();
        assert_eq!(mapping.shard_id, "shard2");
        assert_eq!(mapping.region.as_deref(), Some("us-west"));

        let missing = store.update(4040, MappingChange::move_to("shard1")).await.unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn iteration_pages_in_tenant_order() {
        let store = sqlite_store().await;
        for id in [5, 2, 9, 3, 8] {
            let shard = if id % 2 == 0 { "shard2" } else { "shard1" };
            store.create(id, shard, None).await.unwrap();
        }

        let first = store.iterate_all(None, 2).await.unwrap();
        assert_eq!(first.iter().map(|m| m.tenant_id).collect::<Vec<_>>(), vec![2, 3]);
        let second = store.iterate_all(Some(3), 10).await.unwrap();
        assert_eq!(second.iter().map(|m| m.tenant_id).collect::<Vec<_>>(), vec![5, 8, 9]);

        let shard1_only = store.iterate_by_shard("shard1", None, 10).await.unwrap();
        assert_eq!(
            shard1_only.iter().map(|m| m.tenant_id).collect::<Vec<_>>(),
            vec![3, 5, 9]
        );
    }

    #[tokio::test]
    async fn memory_store_matches_sql_semantics() {
        let store = MemoryDirectoryStore::new();
        store.create(1, "shard1", None).await.unwrap();
        assert_eq!(
            store.create(1, "shard1", None).await.unwrap_err().kind(),
            "AlreadyExists"
        );
        assert!(store.update(1, MappingChange::move_to("shard2")).await.unwrap());
        assert!(!store.update(2, MappingChange::move_to("shard2")).await.unwrap());
        assert_eq!(store.find(1).await.unwrap().unwrap().shard_id, "shard2");
    }
}
