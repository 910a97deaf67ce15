// Routing data source - the single logical connection source handed to the
// application. Every acquisition consults the router; every statement that
// flows through a routed connection passes the validator first.

use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Row};
use std::sync::Arc;
use tracing::debug;

use crate::error::{RouterError, RouterResult};
use crate::infrastructure::entity_registry::EntityClassifier;
use crate::infrastructure::pool_set::Endpoint;
use crate::infrastructure::query_validator::QueryValidator;
use crate::infrastructure::router::ConnectionRouter;
use crate::infrastructure::shard_registry::ShardRegistry;
use crate::infrastructure::transactions::{RoutedTransaction, RoutingTransactionManager};

/// Bind parameter for routed statements. Keeps the call surface free of
/// sqlx generics.
#[derive(Debug, Clone)]
pub enum SqlParam {
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::I64(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Str(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Str(v)
    }
}

pub(crate) fn bind_params<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[SqlParam],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::I64(v) => query.bind(*v),
            SqlParam::F64(v) => query.bind(*v),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Str(v) => query.bind(v.clone()),
            SqlParam::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

/// The connection-acquisition contract. Callers use this in place of a
/// plain data source; routing happens on every acquisition.
pub struct RoutingDataSource {
    router: Arc<ConnectionRouter>,
    classifier: Arc<EntityClassifier>,
    validator: Arc<QueryValidator>,
    transactions: Arc<RoutingTransactionManager>,
}

impl RoutingDataSource {
    pub fn new(
        router: Arc<ConnectionRouter>,
        classifier: Arc<EntityClassifier>,
        validator: Arc<QueryValidator>,
        transactions: Arc<RoutingTransactionManager>,
    ) -> Self {
        Self {
            router,
            classifier,
            validator,
            transactions,
        }
    }

    pub fn validator(&self) -> &Arc<QueryValidator> {
        &self.validator
    }

    pub fn transactions(&self) -> &Arc<RoutingTransactionManager> {
        &self.transactions
    }

    /// Acquire a connection for work on `table` (`None` routes globally).
    pub fn acquire(&self, table: Option<&str>) -> RouterResult<RoutedConnection> {
        let sharded = table.map(|t| self.classifier.is_sharded(t)).unwrap_or(false);
        self.acquire_sharded(sharded)
    }

    /// Acquire a connection for a concrete statement; sharded-ness is
    /// inferred from the tables it references.
    pub fn acquire_for_statement(&self, sql: &str) -> RouterResult<RoutedConnection> {
        let report = self.validator.inspect(sql);
        let sharded = report.tables.iter().any(|t| self.classifier.is_sharded(t));
        self.acquire_sharded(sharded)
    }

    pub fn acquire_sharded(&self, sharded: bool) -> RouterResult<RoutedConnection> {
        let endpoint = self.router.choose(sharded)?;
        debug!("Acquired routed connection on {}", endpoint.id);
        Ok(RoutedConnection {
            endpoint,
            validator: Arc::clone(&self.validator),
            registry: Arc::clone(self.router.registry()),
        })
    }

    /// Begin a transaction for work on `table`. The endpoint chosen here
    /// is pinned for the transaction's whole lifetime.
    pub async fn begin(&self, table: Option<&str>) -> RouterResult<RoutedTransaction> {
        let sharded = table.map(|t| self.classifier.is_sharded(t)).unwrap_or(false);
        self.transactions.begin(sharded).await
    }

    /// Run `sql` with routing inferred from the statement itself.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> RouterResult<u64> {
        self.acquire_for_statement(sql)?.execute(sql, params).await
    }

    pub async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> RouterResult<Vec<AnyRow>> {
        self.acquire_for_statement(sql)?.fetch_all(sql, params).await
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> RouterResult<Option<AnyRow>> {
        self.acquire_for_statement(sql)?.fetch_optional(sql, params).await
    }
}

/// A pool handle bound to one routed endpoint. Statements are validated
/// before execution; connect failures feed replica health.
pub struct RoutedConnection {
    endpoint: Endpoint,
    validator: Arc<QueryValidator>,
    registry: Arc<ShardRegistry>,
}

impl RoutedConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Statements use `?` placeholders; they are rewritten to the
    /// endpoint's dialect before execution.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> RouterResult<u64> {
        self.validator.validate(sql)?;
        let sql = self.endpoint.dialect.rewrite(sql);
        let result = bind_params(sqlx::query(&sql), params)
            .execute(&self.endpoint.pool)
            .await;
        self.note_outcome(&result);
        Ok(result.map_err(RouterError::from)?.rows_affected())
    }

    pub async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> RouterResult<Vec<AnyRow>> {
        self.validator.validate(sql)?;
        let sql = self.endpoint.dialect.rewrite(sql);
        let result = bind_params(sqlx::query(&sql), params)
            .fetch_all(&self.endpoint.pool)
            .await;
        self.note_outcome(&result);
        result.map_err(RouterError::from)
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> RouterResult<Option<AnyRow>> {
        self.validator.validate(sql)?;
        let sql = self.endpoint.dialect.rewrite(sql);
        let result = bind_params(sqlx::query(&sql), params)
            .fetch_optional(&self.endpoint.pool)
            .await;
        self.note_outcome(&result);
        result.map_err(RouterError::from)
    }

    pub async fn fetch_one(&self, sql: &str, params: &[SqlParam]) -> RouterResult<AnyRow> {
        self.validator.validate(sql)?;
        let sql = self.endpoint.dialect.rewrite(sql);
        let result = bind_params(sqlx::query(&sql), params)
            .fetch_one(&self.endpoint.pool)
            .await;
        self.note_outcome(&result);
        result.map_err(RouterError::from)
    }

    pub async fn fetch_scalar_i64(&self, sql: &str, params: &[SqlParam]) -> RouterResult<i64> {
        let row = self.fetch_one(sql, params).await?;
        row.try_get::<i64, _>(0).map_err(RouterError::from)
    }

    /// Feed replica health from real connection outcomes. Only transport
    /// failures count; SQL errors mean the replica answered.
    fn note_outcome<T>(&self, result: &Result<T, sqlx::Error>) {
        let crate::infrastructure::pool_set::EndpointId::ShardReplica(shard_id, index) =
            &self.endpoint.id
        else {
            return;
        };
        let Ok(shard) = self.registry.get(shard_id) else {
            return;
        };
        match result {
            Ok(_) => shard.mark_replica_success(*index),
            Err(sqlx::Error::Io(_))
            | Err(sqlx::Error::PoolTimedOut)
            | Err(sqlx::Error::Tls(_)) => shard.mark_replica_failure(*index),
            Err(_) => {}
        }
    }
}
