// Shard lookup service - the read/write path over the directory with the
// cache in front. Concurrent misses on one tenant share a single in-flight
// directory read.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{RouterError, RouterResult};
use crate::infrastructure::context;
use crate::infrastructure::directory::{
    DirectoryStore, MappingChange, TenantId, TenantShardMapping,
};
use crate::infrastructure::lookup_cache::{CacheOutcome, CacheStats, LookupCache};
use crate::infrastructure::monitoring::RouterMetrics;
use crate::infrastructure::shard_registry::ShardRegistry;

type SharedLookup =
    Shared<BoxFuture<'static, Result<Option<TenantShardMapping>, Arc<RouterError>>>>;

pub struct ShardLookupService {
    store: Arc<dyn DirectoryStore>,
    cache: Arc<dyn LookupCache>,
    registry: Arc<ShardRegistry>,
    metrics: Arc<RouterMetrics>,
    inflight: Mutex<HashMap<TenantId, (u64, SharedLookup)>>,
    inflight_gen: AtomicU64,
}

impl ShardLookupService {
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        cache: Arc<dyn LookupCache>,
        registry: Arc<ShardRegistry>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            metrics,
            inflight: Mutex::new(HashMap::new()),
            inflight_gen: AtomicU64::new(0),
        }
    }

    /// Resolve a tenant's mapping: cache first, then the directory, with
    /// the result written back. At most one directory read is in flight
    /// per tenant id; concurrent callers wait on the shared future.
    pub async fn find_shard_by_tenant_id(
        &self,
        tenant_id: TenantId,
    ) -> RouterResult<Option<TenantShardMapping>> {
        if let Some(ctx) = context::current() {
            ctx.check_deadline()?;
        }

        match self.cache.get(tenant_id).await {
            CacheOutcome::Present(mapping) => return Ok(Some(mapping)),
            CacheOutcome::NegativeHit => return Ok(None),
            CacheOutcome::Absent => {}
        }

        let (generation, lookup) = {
            let mut inflight = self.inflight.lock().expect("inflight lock");
            match inflight.get(&tenant_id) {
                Some((generation, lookup)) => (*generation, lookup.clone()),
                None => {
                    let generation = self.inflight_gen.fetch_add(1, Ordering::Relaxed);
                    let store = Arc::clone(&self.store);
                    let cache = Arc::clone(&self.cache);
                    let metrics = Arc::clone(&self.metrics);
                    let lookup: SharedLookup = async move {
                        metrics.directory_reads.fetch_add(1, Ordering::Relaxed);
                        match store.find(tenant_id).await {
                            Ok(Some(mapping)) => {
                                cache.put(tenant_id, mapping.clone()).await;
                                Ok(Some(mapping))
                            }
                            Ok(None) => {
                                cache.put_negative(tenant_id).await;
                                Ok(None)
                            }
                            Err(e) => Err(Arc::new(e)),
                        }
                    }
                    .boxed()
                    .shared();
                    inflight.insert(tenant_id, (generation, lookup.clone()));
                    (generation, lookup)
                }
            }
        };

        let result = lookup.await;

        {
            let mut inflight = self.inflight.lock().expect("inflight lock");
            if let Some((current, _)) = inflight.get(&tenant_id) {
                if *current == generation {
                    inflight.remove(&tenant_id);
                }
            }
        }

        result.map_err(|e| {
            RouterError::Database(anyhow::anyhow!(
                "directory lookup for tenant {} failed: {}",
                tenant_id,
                e
            ))
        })
    }

    /// Provision a tenant on a shard. Write-through: the fresh mapping is
    /// cached before returning.
    pub async fn create_mapping(
        &self,
        tenant_id: TenantId,
        shard_id: &str,
        region: Option<&str>,
    ) -> RouterResult<TenantShardMapping> {
        if !self.registry.contains(shard_id) {
            return Err(RouterError::UnknownShard(shard_id.to_string()));
        }
        let mapping = self.store.create(tenant_id, shard_id, region).await?;
        self.cache.put(tenant_id, mapping.clone()).await;
        info!("Tenant {} provisioned on shard {}", tenant_id, shard_id);
        Ok(mapping)
    }

    /// Update a tenant's mapping; the cache entry is invalidated so the
    /// next lookup observes the new row. Returns `false` when no row
    /// existed.
    pub async fn update_mapping(
        &self,
        tenant_id: TenantId,
        change: MappingChange,
    ) -> RouterResult<bool> {
        if let Some(shard_id) = &change.shard_id {
            if !self.registry.contains(shard_id) {
                return Err(RouterError::UnknownShard(shard_id.clone()));
            }
        }
        let updated = self.store.update(tenant_id, change).await?;
        if updated {
            self.cache.invalidate(tenant_id).await;
            debug!("Mapping for tenant {} updated; cache invalidated", tenant_id);
        }
        Ok(updated)
    }

    /// Provision a tenant on the shard currently flagged latest.
    pub async fn assign_tenant_to_latest_shard(
        &self,
        tenant_id: TenantId,
    ) -> RouterResult<TenantShardMapping> {
        let latest = self.registry.latest_shard();
        let region = latest.descriptor.region.clone();
        self.create_mapping(tenant_id, latest.id(), region.as_deref()).await
    }

    pub fn latest_shard_id(&self) -> String {
        self.registry.latest_shard_id().to_string()
    }

    /// Bulk pre-populate the cache for a set of tenants.
    pub async fn warm_up_cache(&self, tenant_ids: &[TenantId]) -> RouterResult<usize> {
        let mut warmed = 0;
        for &tenant_id in tenant_ids {
            if let Some(mapping) = self.store.find(tenant_id).await? {
                self.cache.put(tenant_id, mapping).await;
                warmed += 1;
            }
        }
        info!("Cache warm-up: {}/{} mappings loaded", warmed, tenant_ids.len());
        Ok(warmed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EndpointConfig, RouterConfig, ShardConfig, ShardStatus,
    };
    use crate::infrastructure::directory::MemoryDirectoryStore;
    use crate::infrastructure::lookup_cache::{LocalLookupCache, NoopLookupCache};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CountingStore {
        inner: MemoryDirectoryStore,
        finds: AtomicU64,
        find_delay: Duration,
    }

    impl CountingStore {
        fn new(find_delay: Duration) -> Self {
            Self {
                inner: MemoryDirectoryStore::new(),
                finds: AtomicU64::new(0),
                find_delay,
            }
        }

        fn find_count(&self) -> u64 {
            self.finds.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DirectoryStore for CountingStore {
        async fn find(&self, tenant_id: TenantId) -> RouterResult<Option<TenantShardMapping>> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            if !self.find_delay.is_zero() {
                tokio::time::sleep(self.find_delay).await;
            }
            self.inner.find(tenant_id).await
        }

        async fn create(
            &self,
            tenant_id: TenantId,
            shard_id: &str,
            region: Option<&str>,
        ) -> RouterResult<TenantShardMapping> {
            self.inner.create(tenant_id, shard_id, region).await
        }

        async fn update(&self, tenant_id: TenantId, change: MappingChange) -> RouterResult<bool> {
            self.inner.update(tenant_id, change).await
        }

        async fn iterate_all(
            &self,
            cursor: Option<TenantId>,
            limit: u32,
        ) -> RouterResult<Vec<TenantShardMapping>> {
            self.inner.iterate_all(cursor, limit).await
        }

        async fn iterate_by_shard(
            &self,
            shard_id: &str,
            cursor: Option<TenantId>,
            limit: u32,
        ) -> RouterResult<Vec<TenantShardMapping>> {
            self.inner.iterate_by_shard(shard_id, cursor, limit).await
        }
    }

    fn registry() -> Arc<ShardRegistry> {
        let config = RouterConfig {
            global_db: EndpointConfig::new("sqlite::memory:"),
            shards: vec![
                ShardConfig {
                    id: "shard1".to_string(),
                    master: EndpointConfig::new("sqlite::memory:"),
                    replicas: vec![],
                    region: Some("us-east".to_string()),
                    latest: true,
                    status: ShardStatus::Active,
                    pool: None,
                },
                ShardConfig {
                    id: "shard2".to_string(),
                    master: EndpointConfig::new("sqlite::memory:"),
                    replicas: vec![],
                    region: Some("us-west".to_string()),
                    latest: false,
                    status: ShardStatus::Active,
                    pool: None,
                },
            ],
            pool: Default::default(),
            cache: Default::default(),
            validation: Default::default(),
            replica: Default::default(),
            excluded_paths: vec![],
        };
        Arc::new(ShardRegistry::from_config(&config).unwrap())
    }

    fn service(store: Arc<dyn DirectoryStore>) -> ShardLookupService {
        let metrics = RouterMetrics::new();
        let cache = Arc::new(LocalLookupCache::new(
            1024,
            Duration::from_secs(3600),
            None,
            metrics.clone(),
        ));
        ShardLookupService::new(store, cache, registry(), metrics)
    }

    #[tokio::test]
    async fn miss_storm_issues_exactly_one_directory_read() {
        let store = Arc::new(CountingStore::new(Duration::from_millis(50)));
        store.inner.create(2002, "shard1", None).await.unwrap();
        let service = Arc::new(service(store.clone()));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                service.find_shard_by_tenant_id(2002).await
            }));
        }
        for task in tasks {
            let mapping = task.await.unwrap().unwrap().unwrap();
            assert_eq!(mapping.shard_id, "shard1");
        }

        assert_eq!(store.find_count(), 1);
    }

    #[tokio::test]
    async fn create_writes_through_to_cache() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        let service = service(store.clone());

        service.create_mapping(1001, "shard1", Some("us-east")).await.unwrap();

        // Served from cache: no directory read.
        let mapping = service.find_shard_by_tenant_id(1001).await.unwrap().unwrap();
        assert_eq!(mapping.shard_id, "shard1");
        assert_eq!(store.find_count(), 0);
    }

    #[tokio::test]
    async fn update_invalidates_and_rereads() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        let service = service(store.clone());

        service.create_mapping(1001, "shard1", Some("us-east")).await.unwrap();
        let updated = service
            .update_mapping(1001, MappingChange::move_to("shard2").with_region("us-west"))
            .await
            .unwrap();
        assert!(updated);

        // Read-your-writes: the stale cached row must not be served.
        let mapping = service.find_shard_by_tenant_id(1001).await.unwrap().unwrap();
        assert_eq!(mapping.shard_id, "shard2");
        assert_eq!(mapping.region.as_deref(), Some("us-west"));
        assert_eq!(store.find_count(), 1);
    }

    #[tokio::test]
    async fn update_of_missing_tenant_returns_false() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        let service = service(store);
        let updated = service
            .update_mapping(404, MappingChange::move_to("shard1"))
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn create_on_unknown_shard_is_rejected() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        let service = service(store);
        let err = service.create_mapping(1, "shard9", None).await.unwrap_err();
        assert_eq!(err.kind(), "UnknownShard");

        let err = service
            .update_mapping(1, MappingChange::move_to("shard9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownShard");
    }

    #[tokio::test]
    async fn assign_to_latest_uses_registry_flag_and_region() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        let service = service(store);

        let mapping = service.assign_tenant_to_latest_shard(1001).await.unwrap();
        assert_eq!(mapping.shard_id, "shard1");
        assert_eq!(mapping.region.as_deref(), Some("us-east"));
        assert_eq!(service.latest_shard_id(), "shard1");

        let found = service.find_shard_by_tenant_id(1001).await.unwrap().unwrap();
        assert_eq!(found, mapping);
    }

    #[tokio::test]
    async fn warm_up_populates_cache() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        store.inner.create(1, "shard1", None).await.unwrap();
        store.inner.create(2, "shard2", None).await.unwrap();
        let service = service(store.clone());

        let warmed = service.warm_up_cache(&[1, 2, 3]).await.unwrap();
        assert_eq!(warmed, 2);

        store.finds.store(0, Ordering::SeqCst);
        assert!(service.find_shard_by_tenant_id(1).await.unwrap().is_some());
        assert!(service.find_shard_by_tenant_id(2).await.unwrap().is_some());
        assert_eq!(store.find_count(), 0);
    }

    #[tokio::test]
    async fn disabled_cache_reads_store_every_time() {
        let store = Arc::new(CountingStore::new(Duration::ZERO));
        store.inner.create(1, "shard1", None).await.unwrap();
        let metrics = RouterMetrics::new();
        let service = ShardLookupService::new(
            store.clone(),
            Arc::new(NoopLookupCache),
            registry(),
            metrics,
        );

        service.find_shard_by_tenant_id(1).await.unwrap();
        service.find_shard_by_tenant_id(1).await.unwrap();
        assert_eq!(store.find_count(), 2);
    }
}
