// Factory - turns a validated RouterConfig into the fully wired routing
// system. Configuration problems fail here, before any traffic.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{CacheType, RouterConfig};
use crate::error::RouterResult;
use crate::infrastructure::directory::{DirectoryStore, SqlDirectoryStore};
use crate::infrastructure::entity_registry::{EntityClass, EntityClassifier};
use crate::infrastructure::lookup_cache::{
    DistributedKv, DistributedLookupCache, LocalLookupCache, LookupCache, MemoryKv,
    NoopLookupCache,
};
use crate::infrastructure::lookup_service::ShardLookupService;
use crate::infrastructure::monitoring::RouterMetrics;
use crate::infrastructure::pool_set::{ConnectionPoolSet, Dialect};
use crate::infrastructure::query_validator::QueryValidator;
use crate::infrastructure::router::ConnectionRouter;
use crate::infrastructure::routing_source::RoutingDataSource;
use crate::infrastructure::shard_registry::ShardRegistry;
use crate::infrastructure::tenant_iterator::TenantIterator;
use crate::infrastructure::transactions::RoutingTransactionManager;

/// The wired system. Components are shared handles; clone freely.
pub struct ShardRouterSystem {
    pub config: RouterConfig,
    pub registry: Arc<ShardRegistry>,
    pub pools: Arc<ConnectionPoolSet>,
    pub directory: Arc<dyn DirectoryStore>,
    pub cache: Arc<dyn LookupCache>,
    pub lookup: Arc<ShardLookupService>,
    pub router: Arc<ConnectionRouter>,
    pub classifier: Arc<EntityClassifier>,
    pub validator: Arc<QueryValidator>,
    pub transactions: Arc<RoutingTransactionManager>,
    pub data_source: Arc<RoutingDataSource>,
    pub iterator: Arc<TenantIterator>,
    pub metrics: Arc<RouterMetrics>,
}

pub struct ShardRouterFactory {
    config: RouterConfig,
    entities: Vec<EntityClass>,
    distributed_kv: Option<Arc<dyn DistributedKv>>,
    directory_override: Option<Arc<dyn DirectoryStore>>,
}

impl ShardRouterFactory {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            entities: Vec::new(),
            distributed_kv: None,
            directory_override: None,
        }
    }

    /// Table metadata for the entity classifier.
    pub fn with_entities(mut self, entities: Vec<EntityClass>) -> Self {
        self.entities = entities;
        self
    }

    /// Backend for `cache.type = DISTRIBUTED`.
    pub fn with_distributed_kv(mut self, kv: Arc<dyn DistributedKv>) -> Self {
        self.distributed_kv = Some(kv);
        self
    }

    /// Substitute directory store; embedded and test use.
    pub fn with_directory_store(mut self, store: Arc<dyn DirectoryStore>) -> Self {
        self.directory_override = Some(store);
        self
    }

    pub async fn build(self) -> RouterResult<ShardRouterSystem> {
        let config = self.config;
        config.validate()?;

        let metrics = RouterMetrics::new();
        let registry = Arc::new(ShardRegistry::from_config(&config)?);
        let pools = Arc::new(ConnectionPoolSet::from_config(&config)?);

        let directory: Arc<dyn DirectoryStore> = match self.directory_override {
            Some(store) => store,
            None => {
                let dialect = Dialect::detect(&config.global_db.url)?;
                let store = SqlDirectoryStore::new(pools.global().pool.clone(), dialect);
                store.ensure_schema().await?;
                Arc::new(store)
            }
        };

        let cache = build_cache(&config, self.distributed_kv, Arc::clone(&metrics));
        let lookup = Arc::new(ShardLookupService::new(
            Arc::clone(&directory),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));

        let router = Arc::new(ConnectionRouter::new(
            Arc::clone(&registry),
            Arc::clone(&pools),
            config.replica.selection,
            Arc::clone(&metrics),
        ));

        let default_column = config
            .validation
            .tenant_column_names
            .first()
            .cloned()
            .unwrap_or_else(|| "account_id".to_string());
        let classifier = Arc::new(EntityClassifier::new(self.entities, default_column));
        let validator = Arc::new(QueryValidator::new(
            Arc::clone(&classifier),
            config.validation.strictness,
            &config.validation.tenant_column_names,
            Arc::clone(&metrics),
        ));

        let transactions = Arc::new(RoutingTransactionManager::new(
            Arc::clone(&router),
            Arc::clone(&validator),
        ));
        let data_source = Arc::new(RoutingDataSource::new(
            Arc::clone(&router),
            Arc::clone(&classifier),
            Arc::clone(&validator),
            Arc::clone(&transactions),
        ));
        let iterator = Arc::new(TenantIterator::new(
            Arc::clone(&directory),
            Arc::clone(&router),
        ));

        if config.replica.health_check_interval_ms > 0 {
            spawn_replica_probe(
                Arc::clone(&registry),
                Arc::clone(&pools),
                Duration::from_millis(config.replica.health_check_interval_ms),
            );
        }

        info!(
            "Shard router ready: {} shards, latest {}, validation {:?}, cache {:?}",
            config.shards.len(),
            registry.latest_shard_id(),
            config.validation.strictness,
            config.cache.cache_type
        );

        Ok(ShardRouterSystem {
            config,
            registry,
            pools,
            directory,
            cache,
            lookup,
            router,
            classifier,
            validator,
            transactions,
            data_source,
            iterator,
            metrics,
        })
    }
}

/// Background recovery loop: replicas taken out of rotation get a probe
/// each interval and rejoin on success.
fn spawn_replica_probe(
    registry: Arc<ShardRegistry>,
    pools: Arc<ConnectionPoolSet>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for shard in registry.list() {
                for index in 0..shard.replica_count() {
                    let excluded = shard
                        .replica_health(index)
                        .map(|h| !h.is_healthy())
                        .unwrap_or(false);
                    if !excluded {
                        continue;
                    }
                    let id = crate::infrastructure::pool_set::EndpointId::ShardReplica(
                        shard.id().to_string(),
                        index,
                    );
                    match pools.health_check(&id).await {
                        Ok(()) => shard.mark_replica_success(index),
                        Err(err) => {
                            tracing::debug!("Replica probe {} still failing: {}", id, err)
                        }
                    }
                }
            }
        }
    });
}

fn build_cache(
    config: &RouterConfig,
    kv: Option<Arc<dyn DistributedKv>>,
    metrics: Arc<RouterMetrics>,
) -> Arc<dyn LookupCache> {
    let settings = &config.cache;
    if !settings.enabled || settings.cache_type == CacheType::None {
        return Arc::new(NoopLookupCache);
    }

    let ttl = Duration::from_secs(settings.ttl_seconds);
    let negative_ttl = settings.negative_ttl_seconds.map(Duration::from_secs);

    match settings.cache_type {
        CacheType::Local => Arc::new(LocalLookupCache::new(
            settings.max_size,
            ttl,
            negative_ttl,
            metrics,
        )),
        CacheType::Distributed => {
            let backend = kv.unwrap_or_else(|| {
                warn!(
                    "No distributed cache backend injected for {:?}; using a \
                     process-local stand-in",
                    settings.distributed_endpoint
                );
                Arc::new(MemoryKv::new())
            });
            Arc::new(DistributedLookupCache::new(
                backend,
                settings.key_prefix.clone(),
                ttl,
                negative_ttl,
                metrics,
            ))
        }
        CacheType::None => Arc::new(NoopLookupCache),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, PoolSettings, ShardConfig, ShardStatus};

    fn config() -> RouterConfig {
        RouterConfig {
            global_db: EndpointConfig::new("sqlite::memory:"),
            shards: vec![ShardConfig {
                id: "shard1".to_string(),
                master: EndpointConfig::new("sqlite::memory:"),
                replicas: vec![],
                region: Some("us-east".to_string()),
                latest: true,
                status: ShardStatus::Active,
                pool: None,
            }],
            pool: PoolSettings {
                maximum_pool_size: 1,
                minimum_idle: 0,
                ..Default::default()
            },
            cache: Default::default(),
            validation: Default::default(),
            replica: Default::default(),
            excluded_paths: vec![],
        }
    }

    #[tokio::test]
    async fn build_wires_a_working_system() {
        let system = ShardRouterFactory::new(config())
            .with_entities(vec![EntityClass::sharded("tickets", "account_id")])
            .build()
            .await
            .unwrap();

        assert_eq!(system.registry.latest_shard_id(), "shard1");
        assert!(system.classifier.is_sharded("tickets"));

        // The directory schema exists: provisioning works end to end.
        let mapping = system.lookup.assign_tenant_to_latest_shard(1001).await.unwrap();
        assert_eq!(mapping.shard_id, "shard1");
        let found = system.lookup.find_shard_by_tenant_id(1001).await.unwrap().unwrap();
        assert_eq!(found.shard_id, "shard1");
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let mut bad = config();
        bad.shards[0].latest = false;
        let err = match ShardRouterFactory::new(bad).build().await {
            Ok(_) => panic!("expected build to fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), "Configuration");
    }
}
