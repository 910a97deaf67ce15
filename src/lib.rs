// Shard Router - multi-tenant SQL sharding router
//
// One logical connection source over many physical databases: a global
// database for non-sharded tables and N shards (master + replicas) each
// holding a disjoint subset of tenants. A per-request tenant context
// drives routing; a directory table in the global database is the source
// of truth for tenant placement.

pub mod config;
pub mod error;
pub mod filters;
pub mod infrastructure;

// Re-exports for convenience
pub use config::{
    CacheSettings, CacheType, EndpointConfig, PoolSettings, ReplicaSelection, RouterConfig,
    ShardConfig, ShardStatus, Strictness, ValidationSettings,
};
pub use error::{RouterError, RouterResult};
pub use infrastructure::{
    ConnectionRouter, EntityClass, EntityClassifier, IterationOptions, IterationSummary,
    RoutingDataSource, ShardLookupService, ShardRouterFactory, ShardRouterSystem, SqlParam,
    TenantContext, TenantId, TenantIterator, TenantShardMapping,
};
