// Lookup cache - bounded, TTL-based cache in front of the directory store.
// Two backends: an in-process LRU and a prefix-keyed distributed store.
// The distributed backend never surfaces failures; a broken cache degrades
// to a miss so routing stays live.

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};
use crate::infrastructure::directory::{TenantId, TenantShardMapping};
use crate::infrastructure::monitoring::RouterMetrics;

/// Deadline for any single distributed-cache call. Timeouts downgrade to
/// a miss.
pub const DISTRIBUTED_IO_DEADLINE: Duration = Duration::from_millis(100);

pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// Result of a cache probe. `NegativeHit` is a cached absence still inside
/// its (shorter) TTL; `Absent` means the cache has no opinion.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome {
    Present(TenantShardMapping),
    NegativeHit,
    Absent,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub negative_hits: u64,
    pub degraded_calls: u64,
}

#[async_trait]
pub trait LookupCache: Send + Sync {
    /// Never fails; backend trouble reads as `Absent`.
    async fn get(&self, tenant_id: TenantId) -> CacheOutcome;
    async fn put(&self, tenant_id: TenantId, mapping: TenantShardMapping);
    /// Record an absence. No-op unless negative caching is enabled.
    async fn put_negative(&self, tenant_id: TenantId);
    async fn invalidate(&self, tenant_id: TenantId);
    async fn clear(&self);
    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone)]
struct Slot {
    /// `None` is a cached absence.
    value: Option<TenantShardMapping>,
    expires_at: Instant,
}

impl Slot {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process backend: bounded LRU with per-entry TTL.
pub struct LocalLookupCache {
    entries: Mutex<LruCache<TenantId, Slot>>,
    capacity: usize,
    ttl: Duration,
    negative_ttl: Option<Duration>,
    metrics: Arc<RouterMetrics>,
}

impl LocalLookupCache {
    pub fn new(
        capacity: usize,
        ttl: Duration,
        negative_ttl: Option<Duration>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity is at least 1"),
            )),
            capacity,
            ttl,
            negative_ttl,
            metrics,
        }
    }

    fn insert(&self, tenant_id: TenantId, slot: Slot) {
        let mut entries = self.entries.lock().expect("cache lock");
        if let Some((evicted, _)) = entries.push(tenant_id, slot) {
            if evicted != tenant_id {
                self.metrics.cache_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl LookupCache for LocalLookupCache {
    async fn get(&self, tenant_id: TenantId) -> CacheOutcome {
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(&tenant_id) {
            Some(slot) if slot.is_expired() => {
                entries.pop(&tenant_id);
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                CacheOutcome::Absent
            }
            Some(slot) => match &slot.value {
                Some(mapping) => {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    CacheOutcome::Present(mapping.clone())
                }
                None => {
                    self.metrics.cache_negative_hits.fetch_add(1, Ordering::Relaxed);
                    CacheOutcome::NegativeHit
                }
            },
            None => {
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                CacheOutcome::Absent
            }
        }
    }

    async fn put(&self, tenant_id: TenantId, mapping: TenantShardMapping) {
        self.insert(
            tenant_id,
            Slot {
                value: Some(mapping),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn put_negative(&self, tenant_id: TenantId) {
        let Some(negative_ttl) = self.negative_ttl else {
            return;
        };
        self.insert(
            tenant_id,
            Slot {
                value: None,
                expires_at: Instant::now() + negative_ttl,
            },
        );
    }

    async fn invalidate(&self, tenant_id: TenantId) {
        self.entries.lock().expect("cache lock").pop(&tenant_id);
    }

    async fn clear(&self) {
        self.entries.lock().expect("cache lock").clear();
    }

    fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache lock").len();
        let snap = self.metrics.snapshot();
        CacheStats {
            entries,
            capacity: self.capacity,
            hits: snap.cache_hits,
            misses: snap.cache_misses,
            evictions: snap.cache_evictions,
            negative_hits: snap.cache_negative_hits,
            degraded_calls: snap.cache_degraded,
        }
    }
}

/// Byte-level contract to an out-of-process cache (Redis, Memcached).
/// Implementations are injected; this crate ships an in-memory stand-in.
#[async_trait]
pub trait DistributedKv: Send + Sync {
    async fn get(&self, key: &str) -> RouterResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RouterResult<()>;
    async fn delete(&self, key: &str) -> RouterResult<()>;
    async fn delete_prefix(&self, prefix: &str) -> RouterResult<()>;
}

/// Wire form of a distributed cache value.
#[derive(Debug, Serialize, Deserialize)]
enum CachedValue {
    Mapping(TenantShardMapping),
    Negative,
}

/// Distributed backend: `{prefix}{tenant_id}` keys, bincode values, TTL
/// enforced by the backend.
pub struct DistributedLookupCache {
    backend: Arc<dyn DistributedKv>,
    prefix: String,
    ttl: Duration,
    negative_ttl: Option<Duration>,
    io_deadline: Duration,
    metrics: Arc<RouterMetrics>,
}

impl DistributedLookupCache {
    pub fn new(
        backend: Arc<dyn DistributedKv>,
        prefix: impl Into<String>,
        ttl: Duration,
        negative_ttl: Option<Duration>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            ttl,
            negative_ttl,
            io_deadline: DISTRIBUTED_IO_DEADLINE,
            metrics,
        }
    }

    fn key(&self, tenant_id: TenantId) -> String {
        format!("{}{}", self.prefix, tenant_id)
    }

    fn degraded(&self, op: &str, err: &RouterError) {
        self.metrics.cache_degraded.fetch_add(1, Ordering::Relaxed);
        warn!("Distributed cache {} degraded: {}", op, err);
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = RouterResult<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.io_deadline, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                self.degraded(op, &err);
                None
            }
            Err(_) => {
                self.degraded(
                    op,
                    &RouterError::CacheBackendUnavailable(format!(
                        "{} exceeded {:?}",
                        op, self.io_deadline
                    )),
                );
                None
            }
        }
    }
}

#[async_trait]
impl LookupCache for DistributedLookupCache {
    async fn get(&self, tenant_id: TenantId) -> CacheOutcome {
        let key = self.key(tenant_id);
        let Some(raw) = self.call("get", self.backend.get(&key)).await.flatten() else {
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
            return CacheOutcome::Absent;
        };

        match bincode::deserialize::<CachedValue>(&raw) {
            Ok(CachedValue::Mapping(mapping)) => {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                CacheOutcome::Present(mapping)
            }
            Ok(CachedValue::Negative) => {
                self.metrics.cache_negative_hits.fetch_add(1, Ordering::Relaxed);
                CacheOutcome::NegativeHit
            }
            Err(e) => {
                debug!("Dropping undecodable cache entry {}: {}", key, e);
                self.call("delete", self.backend.delete(&key)).await;
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                CacheOutcome::Absent
            }
        }
    }

    async fn put(&self, tenant_id: TenantId, mapping: TenantShardMapping) {
        let encoded = match bincode::serialize(&CachedValue::Mapping(mapping)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode mapping for tenant {}: {}", tenant_id, e);
                return;
            }
        };
        self.call("put", self.backend.put(&self.key(tenant_id), encoded, self.ttl))
            .await;
    }

    async fn put_negative(&self, tenant_id: TenantId) {
        let Some(negative_ttl) = self.negative_ttl else {
            return;
        };
        let encoded = match bincode::serialize(&CachedValue::Negative) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode negative entry for tenant {}: {}", tenant_id, e);
                return;
            }
        };
        self.call(
            "put_negative",
            self.backend.put(&self.key(tenant_id), encoded, negative_ttl),
        )
        .await;
    }

    async fn invalidate(&self, tenant_id: TenantId) {
        self.call("delete", self.backend.delete(&self.key(tenant_id))).await;
    }

    async fn clear(&self) {
        self.call("delete_prefix", self.backend.delete_prefix(&self.prefix)).await;
    }

    fn stats(&self) -> CacheStats {
        let snap = self.metrics.snapshot();
        CacheStats {
            entries: 0,
            capacity: 0,
            hits: snap.cache_hits,
            misses: snap.cache_misses,
            evictions: snap.cache_evictions,
            negative_hits: snap.cache_negative_hits,
            degraded_calls: snap.cache_degraded,
        }
    }
}

/// Disabled cache: every probe is a miss.
pub struct NoopLookupCache;

#[async_trait]
impl LookupCache for NoopLookupCache {
    async fn get(&self, _tenant_id: TenantId) -> CacheOutcome {
        CacheOutcome::Absent
    }
    async fn put(&self, _tenant_id: TenantId, _mapping: TenantShardMapping) {}
    async fn put_negative(&self, _tenant_id: TenantId) {}
    async fn invalidate(&self, _tenant_id: TenantId) {}
    async fn clear(&self) {}
    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: 0,
            capacity: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            negative_hits: 0,
            degraded_calls: 0,
        }
    }
}

/// Process-local `DistributedKv`, standing in where no external cache is
/// wired up. Honors TTLs.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedKv for MemoryKv {
    async fn get(&self, key: &str) -> RouterResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RouterResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> RouterResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> RouterResult<()> {
        self.entries.write().await.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardStatus;

    fn mapping(tenant_id: TenantId, shard: &str) -> TenantShardMapping {
        TenantShardMapping {
            tenant_id,
            shard_id: shard.to_string(),
            region: None,
            status: ShardStatus::Active,
            created_at: 0,
        }
    }

    fn local(capacity: usize, ttl: Duration) -> LocalLookupCache {
        LocalLookupCache::new(capacity, ttl, Some(DEFAULT_NEGATIVE_TTL), RouterMetrics::new())
    }

    #[tokio::test]
    async fn local_hit_and_miss() {
        let cache = local(10, Duration::from_secs(60));
        assert_eq!(cache.get(1).await, CacheOutcome::Absent);

        cache.put(1, mapping(1, "shard1")).await;
        assert_eq!(cache.get(1).await, CacheOutcome::Present(mapping(1, "shard1")));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn local_entries_expire() {
        let cache = local(10, Duration::from_millis(5));
        cache.put(1, mapping(1, "shard1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(1).await, CacheOutcome::Absent);
    }

    #[tokio::test]
    async fn local_lru_evicts_on_overflow() {
        let cache = local(2, Duration::from_secs(60));
        cache.put(1, mapping(1, "a")).await;
        cache.put(2, mapping(2, "b")).await;
        cache.put(3, mapping(3, "c")).await;

        assert_eq!(cache.get(1).await, CacheOutcome::Absent);
        assert!(matches!(cache.get(3).await, CacheOutcome::Present(_)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn negative_entries_are_distinct_from_misses() {
        let cache = local(10, Duration::from_secs(60));
        cache.put_negative(7).await;
        assert_eq!(cache.get(7).await, CacheOutcome::NegativeHit);

        cache.invalidate(7).await;
        assert_eq!(cache.get(7).await, CacheOutcome::Absent);
    }

    #[tokio::test]
    async fn negative_caching_disabled_is_a_noop() {
        let cache =
            LocalLookupCache::new(10, Duration::from_secs(60), None, RouterMetrics::new());
        cache.put_negative(7).await;
        assert_eq!(cache.get(7).await, CacheOutcome::Absent);
    }

    #[tokio::test]
    async fn distributed_roundtrip_through_bincode() {
        let cache = DistributedLookupCache::new(
            Arc::new(MemoryKv::new()),
            "tenant-shard:",
            Duration::from_secs(60),
            Some(DEFAULT_NEGATIVE_TTL),
            RouterMetrics::new(),
        );
        cache.put(42, mapping(42, "shard2")).await;
        assert_eq!(cache.get(42).await, CacheOutcome::Present(mapping(42, "shard2")));

        cache.invalidate(42).await;
        assert_eq!(cache.get(42).await, CacheOutcome::Absent);
    }

    struct FailingKv;

    #[async_trait]
    impl DistributedKv for FailingKv {
        async fn get(&self, _key: &str) -> RouterResult<Option<Vec<u8>>> {
            Err(RouterError::CacheBackendUnavailable("connection refused".to_string()))
        }
        async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> RouterResult<()> {
            Err(RouterError::CacheBackendUnavailable("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> RouterResult<()> {
            Err(RouterError::CacheBackendUnavailable("connection refused".to_string()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> RouterResult<()> {
            Err(RouterError::CacheBackendUnavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn distributed_failure_degrades_to_absent() {
        let metrics = RouterMetrics::new();
        let cache = DistributedLookupCache::new(
            Arc::new(FailingKv),
            "tenant-shard:",
            Duration::from_secs(60),
            None,
            metrics.clone(),
        );
        cache.put(1, mapping(1, "shard1")).await;
        assert_eq!(cache.get(1).await, CacheOutcome::Absent);
        assert!(metrics.snapshot().cache_degraded >= 2);
    }
}
