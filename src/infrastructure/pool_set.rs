use once_cell::sync::OnceCell;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::fmt;
use tracing::info;

use crate::config::{PoolSettings, RouterConfig};
use crate::error::{RouterError, RouterResult};
use crate::infrastructure::shard_registry::ShardId;

static ANY_DRIVERS: OnceCell<()> = OnceCell::new();

/// Register the compiled-in sqlx drivers exactly once. Must run before the
/// first `Any` pool is built.
pub fn ensure_any_drivers() {
    ANY_DRIVERS.get_or_init(sqlx::any::install_default_drivers);
}

/// SQL dialect of an endpoint, detected from its connection URL. Drives
/// bind-placeholder syntax and DDL differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn detect(url: &str) -> RouterResult<Self> {
        let scheme = url.split("://").next().unwrap_or("");
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            s if s.starts_with("sqlite") => Ok(Dialect::Sqlite),
            _ => Err(RouterError::Configuration(format!(
                "Cannot detect SQL dialect from URL '{}'",
                url
            ))),
        }
    }

    /// Rewrite `?` placeholders into the dialect's syntax. Question marks
    /// inside string literals are left alone.
    pub fn rewrite(&self, sql: &str) -> String {
        match self {
            Dialect::MySql | Dialect::Sqlite => sql.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0;
                let mut in_literal = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            n += 1;
                            out.push('$');
                            out.push_str(&n.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                out
            }
        }
    }
}

/// Identity of one physical database endpoint. The transaction manager
/// keys its delegates by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointId {
    Global,
    ShardMaster(ShardId),
    ShardReplica(ShardId, usize),
}

impl EndpointId {
    pub fn shard_id(&self) -> Option<&str> {
        match self {
            EndpointId::Global => None,
            EndpointId::ShardMaster(id) | EndpointId::ShardReplica(id, _) => Some(id),
        }
    }

    pub fn is_replica(&self) -> bool {
        matches!(self, EndpointId::ShardReplica(_, _))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Global => write!(f, "global"),
            EndpointId::ShardMaster(id) => write!(f, "{}.master", id),
            EndpointId::ShardReplica(id, n) => write!(f, "{}.replica{}", id, n),
        }
    }
}

/// One physical endpoint: its identity, its pool, its SQL dialect, and
/// whether connections from it may be handed to writable contexts.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub url: String,
    pub read_only: bool,
    pub dialect: Dialect,
    pub pool: AnyPool,
}

/// Per-endpoint pools for the global database and every shard master and
/// replica, built eagerly at startup.
#[derive(Debug)]
pub struct ConnectionPoolSet {
    endpoints: HashMap<EndpointId, Endpoint>,
}

impl ConnectionPoolSet {
    pub fn from_config(config: &RouterConfig) -> RouterResult<Self> {
        ensure_any_drivers();

        let mut endpoints = HashMap::new();

        let global_url = config.global_db.connect_url();
        endpoints.insert(
            EndpointId::Global,
            Endpoint {
                id: EndpointId::Global,
                dialect: Dialect::detect(&global_url)?,
                read_only: false,
                pool: build_pool(&config.pool, &global_url)?,
                url: global_url,
            },
        );

        for shard in &config.shards {
            let settings = config.pool_for(shard);

            let master_id = EndpointId::ShardMaster(shard.id.clone());
            let master_url = shard.master.connect_url();
            endpoints.insert(
                master_id.clone(),
                Endpoint {
                    id: master_id,
                    dialect: Dialect::detect(&master_url)?,
                    read_only: false,
                    pool: build_pool(settings, &master_url)?,
                    url: master_url,
                },
            );

            for (index, replica) in shard.replicas.iter().enumerate() {
                let id = EndpointId::ShardReplica(shard.id.clone(), index);
                let url = replica.connect_url();
                endpoints.insert(
                    id.clone(),
                    Endpoint {
                        id,
                        dialect: Dialect::detect(&url)?,
                        read_only: true,
                        pool: build_pool(settings, &url)?,
                        url,
                    },
                );
            }
        }

        info!("Connection pool set ready: {} endpoints", endpoints.len());
        Ok(Self { endpoints })
    }

    pub fn endpoint(&self, id: &EndpointId) -> RouterResult<&Endpoint> {
        self.endpoints.get(id).ok_or_else(|| {
            RouterError::UnknownShard(id.shard_id().unwrap_or("global").to_string())
        })
    }

    pub fn global(&self) -> &Endpoint {
        self.endpoints
            .get(&EndpointId::Global)
            .expect("global endpoint built at startup")
    }

    pub fn shard_master(&self, shard_id: &str) -> RouterResult<&Endpoint> {
        self.endpoint(&EndpointId::ShardMaster(shard_id.to_string()))
    }

    pub fn shard_replica(&self, shard_id: &str, index: usize) -> RouterResult<&Endpoint> {
        self.endpoint(&EndpointId::ShardReplica(shard_id.to_string(), index))
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.endpoints.keys().cloned().collect()
    }

    /// Round-trip probe for one endpoint.
    pub async fn health_check(&self, id: &EndpointId) -> RouterResult<()> {
        let endpoint = self.endpoint(id)?;
        sqlx::query("SELECT 1").execute(&endpoint.pool).await?;
        Ok(())
    }
}

fn build_pool(settings: &PoolSettings, url: &str) -> RouterResult<AnyPool> {
    AnyPoolOptions::new()
        .max_connections(settings.maximum_pool_size)
        .min_connections(settings.minimum_idle)
        .acquire_timeout(settings.acquire_timeout())
        .idle_timeout(settings.idle_timeout())
        .max_lifetime(settings.max_lifetime())
        .test_before_acquire(true)
        .connect_lazy(url)
        .map_err(|e| RouterError::Configuration(format!("Invalid endpoint URL {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, ShardConfig, ShardStatus};

    fn config() -> RouterConfig {
        RouterConfig {
            global_db: EndpointConfig::new("sqlite::memory:"),
            shards: vec![ShardConfig {
                id: "shard1".to_string(),
                master: EndpointConfig::new("sqlite::memory:"),
                replicas: vec![
                    EndpointConfig::new("sqlite::memory:"),
                    EndpointConfig::new("sqlite::memory:"),
                ],
                region: None,
                latest: true,
                status: ShardStatus::Active,
                pool: None,
            }],
            pool: Default::default(),
            cache: Default::default(),
            validation: Default::default(),
            replica: Default::default(),
            excluded_paths: vec![],
        }
    }

    #[tokio::test]
    async fn builds_one_pool_per_endpoint() {
        let pools = ConnectionPoolSet::from_config(&config()).unwrap();
        assert_eq!(pools.endpoint_ids().len(), 4);
        assert!(pools.shard_master("shard1").is_ok());
        assert!(pools.shard_replica("shard1", 1).is_ok());
        assert!(pools.shard_replica("shard1", 0).unwrap().read_only);
        assert!(!pools.global().read_only);
    }

    #[tokio::test]
    async fn unknown_endpoint_is_an_error() {
        let pools = ConnectionPoolSet::from_config(&config()).unwrap();
        let err = pools.shard_master("shard9").unwrap_err();
        assert_eq!(err.kind(), "UnknownShard");
    }

    #[test]
    fn dialect_detection() {
        assert_eq!(Dialect::detect("postgres://h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::detect("postgresql://h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::detect("mysql://h/db").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::detect("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert!(Dialect::detect("oracle://h/db").is_err());
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let sql = Dialect::Postgres.rewrite("UPDATE t SET a = ?, b = ? WHERE id = ?");
        assert_eq!(sql, "UPDATE t SET a = $1, b = $2 WHERE id = $3");
        assert_eq!(
            Dialect::Postgres.rewrite("SELECT * FROM t WHERE note = 'what?' AND id = ?"),
            "SELECT * FROM t WHERE note = 'what?' AND id = $1"
        );
        assert_eq!(
            Dialect::Sqlite.rewrite("SELECT * FROM t WHERE id = ?"),
            "SELECT * FROM t WHERE id = ?"
        );
    }

    #[test]
    fn endpoint_id_display_names_the_physical_target() {
        assert_eq!(EndpointId::Global.to_string(), "global");
        assert_eq!(
            EndpointId::ShardMaster("shard1".to_string()).to_string(),
            "shard1.master"
        );
        assert_eq!(
            EndpointId::ShardReplica("shard1".to_string(), 2).to_string(),
            "shard1.replica2"
        );
    }
}
