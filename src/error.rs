use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Router error taxonomy. Every variant carries a stable kind string so
/// callers can match on behavior without parsing messages.
#[derive(Debug)]
pub enum RouterError {
    /// Sharded access attempted with no tenant installed in the context.
    MissingTenantContext,
    /// Tenant has no row in the directory.
    UnknownTenant(i64),
    /// Shard id referenced by the directory or a caller is not configured.
    UnknownShard(String),
    /// Writable access requested against a READ_ONLY shard.
    ShardNotWritable(String),
    /// Shard (or a tenant's mapping) is disabled.
    ShardDisabled(String),
    /// Statement against a sharded table lacks a tenant predicate.
    TenantFilterMissing { table: String, statement: String },
    /// Nested transaction begin resolved to a different physical endpoint.
    CrossDataSourceTransaction { active: String, requested: String },
    /// Distributed cache call failed. Recovered locally; never surfaced
    /// from lookups, only visible to code talking to the backend directly.
    CacheBackendUnavailable(String),
    /// Mapping row already exists for this tenant.
    AlreadyExists(i64),
    /// Conditional directory write did not match any row.
    DirectoryWriteConflict(String),
    PoolExhausted(String),
    PoolAcquireTimeout(String),
    /// Context deadline elapsed before the operation started.
    Deadline,
    Database(anyhow::Error),
    Configuration(String),
    BadRequest(String),
    Serialization(String),
}

impl RouterError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::MissingTenantContext => "MissingTenantContext",
            RouterError::UnknownTenant(_) => "UnknownTenant",
            RouterError::UnknownShard(_) => "UnknownShard",
            RouterError::ShardNotWritable(_) => "ShardNotWritable",
            RouterError::ShardDisabled(_) => "ShardDisabled",
            RouterError::TenantFilterMissing { .. } => "TenantFilterMissing",
            RouterError::CrossDataSourceTransaction { .. } => "CrossDataSourceTransaction",
            RouterError::CacheBackendUnavailable(_) => "CacheBackendUnavailable",
            RouterError::AlreadyExists(_) => "AlreadyExists",
            RouterError::DirectoryWriteConflict(_) => "DirectoryWriteConflict",
            RouterError::PoolExhausted(_) => "PoolExhausted",
            RouterError::PoolAcquireTimeout(_) => "PoolAcquireTimeout",
            RouterError::Deadline => "Deadline",
            RouterError::Database(_) => "Database",
            RouterError::Configuration(_) => "Configuration",
            RouterError::BadRequest(_) => "BadRequest",
            RouterError::Serialization(_) => "Serialization",
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::MissingTenantContext => {
                write!(f, "Sharded access requires a tenant context")
            }
            RouterError::UnknownTenant(id) => write!(f, "Tenant {} not found in directory", id),
            RouterError::UnknownShard(id) => write!(f, "Shard '{}' is not configured", id),
            RouterError::ShardNotWritable(id) => {
                write!(f, "Shard '{}' is read-only; write rejected", id)
            }
            RouterError::ShardDisabled(id) => {
                write!(f, "Tenant shard configuration not found: shard '{}' is disabled", id)
            }
            RouterError::TenantFilterMissing { table, statement } => write!(
                f,
                "{} against sharded table '{}' has no tenant predicate",
                statement, table
            ),
            RouterError::CrossDataSourceTransaction { active, requested } => write!(
                f,
                "Transaction bound to {} cannot nest work on {}",
                active, requested
            ),
            RouterError::CacheBackendUnavailable(msg) => {
                write!(f, "Distributed cache unavailable: {}", msg)
            }
            RouterError::AlreadyExists(id) => {
                write!(f, "Mapping for tenant {} already exists", id)
            }
            RouterError::DirectoryWriteConflict(msg) => {
                write!(f, "Directory write conflict: {}", msg)
            }
            RouterError::PoolExhausted(msg) => {
                write!(f, "Connection pool exhausted: {}; retry after backoff", msg)
            }
            RouterError::PoolAcquireTimeout(msg) => {
                write!(f, "Timed out acquiring a connection: {}; retry after backoff", msg)
            }
            RouterError::Deadline => write!(f, "Context deadline elapsed"),
            RouterError::Database(err) => write!(f, "Database error: {}", err),
            RouterError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            RouterError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            RouterError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for RouterError {}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RouterError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RouterError::MissingTenantContext | RouterError::TenantFilterMissing { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            RouterError::UnknownTenant(_) => (StatusCode::NOT_FOUND, self.to_string()),
            RouterError::ShardDisabled(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Tenant shard configuration not found".to_string(),
            ),
            RouterError::Deadline => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            RouterError::PoolExhausted(_) | RouterError::PoolAcquireTimeout(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            RouterError::Database(err) => {
                tracing::error!("Database error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            _ => {
                tracing::error!("Router error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(json!({
            "error": self.kind(),
            "message": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        RouterError::Database(err)
    }
}

impl From<sqlx::Error> for RouterError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                RouterError::PoolAcquireTimeout("pool acquire timed out".to_string())
            }
            sqlx::Error::PoolClosed => RouterError::PoolExhausted("pool closed".to_string()),
            other => RouterError::Database(anyhow::Error::new(other)),
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
