use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{EndpointConfig, ReplicaSelection, RouterConfig, ShardStatus};
use crate::error::{RouterError, RouterResult};

pub type ShardId = String;

/// Consecutive connect failures inside the window before a replica is
/// taken out of rotation.
const REPLICA_FAILURE_THRESHOLD: usize = 3;
const REPLICA_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Static description of one shard: a master endpoint, zero or more
/// replicas, and placement metadata. Immutable after startup; only the
/// replica health flags move at runtime.
#[derive(Debug, Clone)]
pub struct ShardDescriptor {
    pub id: ShardId,
    pub master: EndpointConfig,
    pub replicas: Vec<EndpointConfig>,
    pub region: Option<String>,
    pub latest: bool,
    pub status: ShardStatus,
}

/// Sliding-window failure tracker for a single replica.
#[derive(Debug)]
pub struct ReplicaHealth {
    healthy: AtomicBool,
    failures: Mutex<Vec<Instant>>,
}

impl ReplicaHealth {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a connect failure; trips the breaker once the threshold is
    /// crossed within the window.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut failures = self.failures.lock().expect("replica health lock");
        failures.retain(|t| now.duration_since(*t) < REPLICA_FAILURE_WINDOW);
        failures.push(now);
        if failures.len() >= REPLICA_FAILURE_THRESHOLD {
            self.healthy.store(false, Ordering::Release);
        }
    }

    /// A successful probe restores the replica to rotation.
    pub fn record_success(&self) {
        self.failures.lock().expect("replica health lock").clear();
        self.healthy.store(true, Ordering::Release);
    }
}

/// Per-shard runtime state: the descriptor plus replica health and the
/// round-robin cursor.
#[derive(Debug)]
pub struct ShardRuntime {
    pub descriptor: ShardDescriptor,
    replica_health: Vec<ReplicaHealth>,
    round_robin: AtomicUsize,
}

impl ShardRuntime {
    fn new(descriptor: ShardDescriptor) -> Self {
        let replica_health = descriptor.replicas.iter().map(|_| ReplicaHealth::new()).collect();
        Self {
            descriptor,
            replica_health,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn replica_count(&self) -> usize {
        self.descriptor.replicas.len()
    }

    pub fn replica_health(&self, index: usize) -> Option<&ReplicaHealth> {
        self.replica_health.get(index)
    }

    pub fn mark_replica_failure(&self, index: usize) {
        if let Some(health) = self.replica_health.get(index) {
            health.record_failure();
            if !health.is_healthy() {
                warn!(
                    "Replica {} of shard {} excluded after repeated connect failures",
                    index,
                    self.id()
                );
            }
        }
    }

    pub fn mark_replica_success(&self, index: usize) {
        if let Some(health) = self.replica_health.get(index) {
            let was_healthy = health.is_healthy();
            health.record_success();
            if !was_healthy {
                info!("Replica {} of shard {} back in rotation", index, self.id());
            }
        }
    }

    fn healthy_replica_indices(&self) -> Vec<usize> {
        self.replica_health
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_healthy())
            .map(|(i, _)| i)
            .collect()
    }

    /// Pick a replica index under the configured policy, skipping replicas
    /// currently out of rotation. `None` when no replica is usable; the
    /// router falls back to the master.
    pub fn select_replica(&self, selection: ReplicaSelection) -> Option<usize> {
        let healthy = self.healthy_replica_indices();
        if healthy.is_empty() {
            return None;
        }
        match selection {
            ReplicaSelection::RoundRobin => {
                let slot = self.round_robin.fetch_add(1, Ordering::Relaxed);
                Some(healthy[slot % healthy.len()])
            }
            ReplicaSelection::Random => {
                let mut rng = rand::rng();
                Some(healthy[rng.random_range(0..healthy.len())])
            }
            ReplicaSelection::FirstAvailable => Some(healthy[0]),
        }
    }
}

/// In-memory catalog of every configured shard. Built once at startup from
/// config; lookups are lock-free thereafter.
#[derive(Debug)]
pub struct ShardRegistry {
    shards: HashMap<ShardId, Arc<ShardRuntime>>,
    ordered_ids: Vec<ShardId>,
    latest: ShardId,
}

impl ShardRegistry {
    pub fn from_config(config: &RouterConfig) -> RouterResult<Self> {
        config.validate()?;

        let mut shards = HashMap::new();
        let mut ordered_ids = Vec::new();
        let mut latest = None;

        for shard in &config.shards {
            let descriptor = ShardDescriptor {
                id: shard.id.clone(),
                master: shard.master.clone(),
                replicas: shard.replicas.clone(),
                region: shard.region.clone(),
                latest: shard.latest,
                status: shard.status,
            };
            if shard.latest {
                latest = Some(shard.id.clone());
            }
            info!(
                "Registered shard {} ({} replicas, region {:?}, status {})",
                shard.id,
                shard.replicas.len(),
                shard.region,
                shard.status.as_str()
            );
            ordered_ids.push(shard.id.clone());
            shards.insert(shard.id.clone(), Arc::new(ShardRuntime::new(descriptor)));
        }

        // validate() guarantees exactly one latest shard
        let latest = latest.ok_or_else(|| {
            RouterError::Configuration("No shard is flagged latest".to_string())
        })?;

        Ok(Self {
            shards,
            ordered_ids,
            latest,
        })
    }

    pub fn get(&self, shard_id: &str) -> RouterResult<Arc<ShardRuntime>> {
        self.shards
            .get(shard_id)
            .cloned()
            .ok_or_else(|| RouterError::UnknownShard(shard_id.to_string()))
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.shards.contains_key(shard_id)
    }

    /// Shards in configuration order.
    pub fn list(&self) -> Vec<Arc<ShardRuntime>> {
        self.ordered_ids
            .iter()
            .filter_map(|id| self.shards.get(id).cloned())
            .collect()
    }

    /// The unique shard receiving newly-provisioned tenants.
    pub fn latest_shard(&self) -> Arc<ShardRuntime> {
        self.shards
            .get(&self.latest)
            .cloned()
            .expect("latest shard validated at startup")
    }

    pub fn latest_shard_id(&self) -> &str {
        &self.latest
    }
}
