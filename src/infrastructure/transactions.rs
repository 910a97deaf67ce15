// Routing transaction manager - a transaction is routed once at begin and
// every statement, commit, and rollback rides the same physical endpoint
// for its whole lifetime. Nesting stays on that endpoint via savepoints.

use sqlx::any::AnyRow;
use sqlx::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RouterError, RouterResult};
use crate::infrastructure::pool_set::{Endpoint, EndpointId};
use crate::infrastructure::query_validator::QueryValidator;
use crate::infrastructure::router::ConnectionRouter;
use crate::infrastructure::routing_source::{bind_params, SqlParam};

/// Per-endpoint delegate. Cached by endpoint identity so repeat
/// transactions reuse it.
pub struct TransactionDelegate {
    endpoint: Endpoint,
    begun: AtomicU64,
}

impl TransactionDelegate {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            begun: AtomicU64::new(0),
        }
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint.id
    }

    pub fn transactions_begun(&self) -> u64 {
        self.begun.load(Ordering::Relaxed)
    }

    async fn begin(&self) -> RouterResult<sqlx::Transaction<'static, Any>> {
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(self.endpoint.pool.begin().await?)
    }
}

pub struct RoutingTransactionManager {
    router: Arc<ConnectionRouter>,
    validator: Arc<QueryValidator>,
    delegates: RwLock<HashMap<EndpointId, Arc<TransactionDelegate>>>,
}

impl RoutingTransactionManager {
    pub fn new(router: Arc<ConnectionRouter>, validator: Arc<QueryValidator>) -> Self {
        Self {
            router,
            validator,
            delegates: RwLock::new(HashMap::new()),
        }
    }

    /// Route once and open a transaction pinned to the chosen endpoint.
    pub async fn begin(&self, sharded: bool) -> RouterResult<RoutedTransaction> {
        let endpoint = self.router.choose(sharded)?;
        let delegate = self.delegate_for(endpoint).await;
        let tx = delegate.begin().await?;
        debug!("Transaction begun on {}", delegate.endpoint_id());
        Ok(RoutedTransaction {
            router: Arc::clone(&self.router),
            validator: Arc::clone(&self.validator),
            delegate,
            tx,
            savepoint_seq: 0,
        })
    }

    async fn delegate_for(&self, endpoint: Endpoint) -> Arc<TransactionDelegate> {
        {
            let delegates = self.delegates.read().await;
            if let Some(delegate) = delegates.get(&endpoint.id) {
                return Arc::clone(delegate);
            }
        }
        let mut delegates = self.delegates.write().await;
        Arc::clone(
            delegates
                .entry(endpoint.id.clone())
                .or_insert_with(|| Arc::new(TransactionDelegate::new(endpoint))),
        )
    }

    pub async fn delegate_count(&self) -> usize {
        self.delegates.read().await.len()
    }
}

/// Handle to a savepoint inside a routed transaction.
#[derive(Debug)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An open transaction, bound to one endpoint. Statements validate before
/// they execute; commit and rollback consume the transaction.
pub struct RoutedTransaction {
    router: Arc<ConnectionRouter>,
    validator: Arc<QueryValidator>,
    delegate: Arc<TransactionDelegate>,
    tx: sqlx::Transaction<'static, Any>,
    savepoint_seq: u32,
}

impl RoutedTransaction {
    pub fn endpoint_id(&self) -> &EndpointId {
        self.delegate.endpoint_id()
    }

    /// Statements use `?` placeholders; they are rewritten to the pinned
    /// endpoint's dialect before execution.
    pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> RouterResult<u64> {
        self.validator.validate(sql)?;
        let sql = self.delegate.endpoint.dialect.rewrite(sql);
        let result = bind_params(sqlx::query(&sql), params)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[SqlParam]) -> RouterResult<Vec<AnyRow>> {
        self.validator.validate(sql)?;
        let sql = self.delegate.endpoint.dialect.rewrite(sql);
        Ok(bind_params(sqlx::query(&sql), params)
            .fetch_all(&mut *self.tx)
            .await?)
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> RouterResult<Option<AnyRow>> {
        self.validator.validate(sql)?;
        let sql = self.delegate.endpoint.dialect.rewrite(sql);
        Ok(bind_params(sqlx::query(&sql), params)
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    /// Nested begin. Re-routes under the current context and fails with
    /// `CrossDataSourceTransaction` unless the choice lands on the data
    /// source this transaction is pinned to; then it is a savepoint.
    pub async fn begin_nested(&mut self, sharded: bool) -> RouterResult<Savepoint> {
        let requested = self.router.choose(sharded)?;
        if requested.id.shard_id() != self.endpoint_id().shard_id() {
            return Err(RouterError::CrossDataSourceTransaction {
                active: self.endpoint_id().to_string(),
                requested: requested.id.to_string(),
            });
        }
        self.savepoint_seq += 1;
        let name = format!("sp_{}", self.savepoint_seq);
        sqlx::query(&format!("SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;
        Ok(Savepoint { name })
    }

    /// Commit a nested begin.
    pub async fn release(&mut self, savepoint: Savepoint) -> RouterResult<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT {}", savepoint.name))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Roll back a nested begin.
    pub async fn rollback_to(&mut self, savepoint: Savepoint) -> RouterResult<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", savepoint.name))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> RouterResult<()> {
        debug!("Committing transaction on {}", self.delegate.endpoint_id());
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> RouterResult<()> {
        debug!("Rolling back transaction on {}", self.delegate.endpoint_id());
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EndpointConfig, PoolSettings, ReplicaSelection, RouterConfig, ShardConfig, ShardStatus,
        Strictness,
    };
    use crate::infrastructure::context::{self, TenantContext};
    use crate::infrastructure::entity_registry::{EntityClass, EntityClassifier};
    use crate::infrastructure::monitoring::RouterMetrics;
    use crate::infrastructure::pool_set::ConnectionPoolSet;
    use crate::infrastructure::shard_registry::ShardRegistry;

    fn config() -> RouterConfig {
        let pool = PoolSettings {
            maximum_pool_size: 1,
            minimum_idle: 0,
            ..Default::default()
        };
        RouterConfig {
            global_db: EndpointConfig::new("sqlite::memory:"),
            shards: vec![
                ShardConfig {
                    id: "shard1".to_string(),
                    master: EndpointConfig::new("sqlite::memory:"),
                    replicas: vec![],
                    region: None,
                    latest: true,
                    status: ShardStatus::Active,
                    pool: None,
                },
                ShardConfig {
                    id: "shard2".to_string(),
                    master: EndpointConfig::new("sqlite::memory:"),
                    replicas: vec![],
                    region: None,
                    latest: false,
                    status: ShardStatus::Active,
                    pool: None,
                },
            ],
            pool,
            cache: Default::default(),
            validation: Default::default(),
            replica: Default::default(),
            excluded_paths: vec![],
        }
    }

    fn manager() -> RoutingTransactionManager {
        let config = config();
        let metrics = RouterMetrics::new();
        let registry = Arc::new(ShardRegistry::from_config(&config).unwrap());
        let pools = Arc::new(ConnectionPoolSet::from_config(&config).unwrap());
        let router = Arc::new(ConnectionRouter::new(
            registry,
            pools,
            ReplicaSelection::RoundRobin,
            metrics.clone(),
        ));
        let classifier = Arc::new(EntityClassifier::new(
            vec![EntityClass::sharded("tickets", "account_id")],
            "account_id",
        ));
        let validator = Arc::new(QueryValidator::new(
            classifier,
            Strictness::Strict,
            &["account_id".to_string()],
            metrics,
        ));
        RoutingTransactionManager::new(router, validator)
    }

    async fn create_tickets_table(tx: &mut RoutedTransaction) {
        tx.execute(
            "CREATE TABLE tickets (id BIGINT PRIMARY KEY, account_id BIGINT, subject TEXT)",
            &[],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn transaction_is_pinned_to_the_shard_master() {
        let manager = manager();
        context::scope(async {
            context::set(TenantContext::for_tenant(1001, "shard1")).unwrap();
            let mut tx = manager.begin(true).await.unwrap();
            assert_eq!(tx.endpoint_id().to_string(), "shard1.master");

            create_tickets_table(&mut tx).await;
            tx.execute(
                "INSERT INTO tickets (id, account_id, subject) VALUES (?, ?, ?)",
                &[SqlParam::I64(1), SqlParam::I64(1001), SqlParam::from("help")],
            )
            .await
            .unwrap();

            // Swapping the ambient context does not move the transaction.
            context::set(TenantContext::for_tenant(2002, "shard2")).unwrap();
            assert_eq!(tx.endpoint_id().to_string(), "shard1.master");
            let rows = tx
                .fetch_all("SELECT id FROM tickets WHERE account_id = ?", &[SqlParam::I64(1001)])
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
            context::clear();

            tx.commit().await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let manager = manager();
        context::scope(async {
            context::set(TenantContext::for_tenant(1001, "shard1")).unwrap();

            let mut tx = manager.begin(true).await.unwrap();
            create_tickets_table(&mut tx).await;
            tx.commit().await.unwrap();

            let mut tx = manager.begin(true).await.unwrap();
            tx.execute(
                "INSERT INTO tickets (id, account_id, subject) VALUES (?, ?, ?)",
                &[SqlParam::I64(1), SqlParam::I64(1001), SqlParam::from("gone")],
            )
            .await
            .unwrap();
            tx.rollback().await.unwrap();

            let mut tx = manager.begin(true).await.unwrap();
            let rows = tx
                .fetch_all("SELECT id FROM tickets WHERE account_id = ?", &[SqlParam::I64(1001)])
                .await
                .unwrap();
            assert!(rows.is_empty());
            tx.commit().await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn nested_begin_uses_savepoints_on_the_same_endpoint() {
        let manager = manager();
        context::scope(async {
            context::set(TenantContext::for_tenant(1001, "shard1")).unwrap();

            let mut tx = manager.begin(true).await.unwrap();
            create_tickets_table(&mut tx).await;
            tx.execute(
                "INSERT INTO tickets (id, account_id, subject) VALUES (?, ?, ?)",
                &[SqlParam::I64(1), SqlParam::I64(1001), SqlParam::from("keep")],
            )
            .await
            .unwrap();

            let savepoint = tx.begin_nested(true).await.unwrap();
            tx.execute(
                "INSERT INTO tickets (id, account_id, subject) VALUES (?, ?, ?)",
                &[SqlParam::I64(2), SqlParam::I64(1001), SqlParam::from("drop")],
            )
            .await
            .unwrap();
            tx.rollback_to(savepoint).await.unwrap();

            let rows = tx
                .fetch_all("SELECT id FROM tickets WHERE account_id = ?", &[SqlParam::I64(1001)])
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
            tx.commit().await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn sharded_nested_in_global_transaction_fails() {
        let manager = manager();
        context::scope(async {
            context::set(TenantContext::for_tenant(1001, "shard1")).unwrap();

            let mut tx = manager.begin(false).await.unwrap();
            assert_eq!(tx.endpoint_id().to_string(), "global");

            let err = tx.begin_nested(true).await.unwrap_err();
            assert_eq!(err.kind(), "CrossDataSourceTransaction");
            tx.rollback().await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn delegates_are_cached_per_endpoint() {
        let manager = manager();
        context::scope(async {
            context::set(TenantContext::for_tenant(1001, "shard1")).unwrap();

            let tx1 = manager.begin(true).await.unwrap();
            tx1.rollback().await.unwrap();
            let tx2 = manager.begin(true).await.unwrap();
            tx2.rollback().await.unwrap();
            let tx3 = manager.begin(false).await.unwrap();
            tx3.rollback().await.unwrap();

            assert_eq!(manager.delegate_count().await, 2);
        })
        .await;
    }
}
