// Connection router - turns the ambient tenant context plus a statement's
// sharded-ness into a physical endpoint choice.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ReplicaSelection, ShardStatus};
use crate::error::{RouterError, RouterResult};
use crate::infrastructure::context::{self, TenantContext};
use crate::infrastructure::monitoring::RouterMetrics;
use crate::infrastructure::pool_set::{ConnectionPoolSet, Endpoint};
use crate::infrastructure::shard_registry::ShardRegistry;

pub struct ConnectionRouter {
    registry: Arc<ShardRegistry>,
    pools: Arc<ConnectionPoolSet>,
    selection: ReplicaSelection,
    metrics: Arc<RouterMetrics>,
}

impl ConnectionRouter {
    pub fn new(
        registry: Arc<ShardRegistry>,
        pools: Arc<ConnectionPoolSet>,
        selection: ReplicaSelection,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            registry,
            pools,
            selection,
            metrics,
        }
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolSet> {
        &self.pools
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Route under the current ambient context. Absent any context the
    /// request is global-only.
    pub fn choose(&self, sharded: bool) -> RouterResult<Endpoint> {
        let ctx = context::current().unwrap_or_else(TenantContext::empty);
        self.choose_for(&ctx, sharded)
    }

    /// Routing decision table:
    ///
    /// | sharded | tenant | read-only | outcome                          |
    /// |---------|--------|-----------|----------------------------------|
    /// | no      | any    | any       | global master                    |
    /// | yes     | set    | no        | shard master                     |
    /// | yes     | set    | yes       | replica, master fallback         |
    /// | yes     | unset  | any       | MissingTenantContext             |
    pub fn choose_for(&self, ctx: &TenantContext, sharded: bool) -> RouterResult<Endpoint> {
        ctx.check_deadline()?;

        if !sharded {
            return Ok(self.pools.global().clone());
        }

        if ctx.tenant_id.is_none() {
            return Err(RouterError::MissingTenantContext);
        }
        let shard_id = ctx
            .shard_id
            .clone()
            .ok_or(RouterError::MissingTenantContext)?;

        // A source pre-selected at context install wins as long as it
        // belongs to the right shard and can satisfy a write when one is
        // needed.
        if let Some(source) = &ctx.selected_source {
            if source.id.shard_id() == Some(shard_id.as_str())
                && !(source.read_only && !ctx.read_only)
            {
                return Ok(source.clone());
            }
        }

        let shard = self.registry.get(&shard_id)?;
        match shard.descriptor.status {
            ShardStatus::Disabled => return Err(RouterError::ShardDisabled(shard_id)),
            ShardStatus::ReadOnly if !ctx.read_only => {
                return Err(RouterError::ShardNotWritable(shard_id))
            }
            _ => {}
        }

        if ctx.read_only {
            if let Some(index) = shard.select_replica(self.selection) {
                let endpoint = self.pools.shard_replica(&shard_id, index)?;
                debug!("Routing tenant {:?} read to {}", ctx.tenant_id, endpoint.id);
                return Ok(endpoint.clone());
            }
            if shard.replica_count() > 0 {
                self.metrics.replica_fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "No healthy replica on shard {}; read falls back to master",
                    shard_id
                );
            }
            // Master serving a read-only context keeps the read-only
            // promise on the returned handle.
            let mut endpoint = self.pools.shard_master(&shard_id)?.clone();
            endpoint.read_only = true;
            return Ok(endpoint);
        }

        Ok(self.pools.shard_master(&shard_id)?.clone())
    }

    /// Resolve the source to pin into a context at request entry: master
    /// for writable contexts, a replica choice for read-only ones.
    pub fn resolve_source(
        &self,
        tenant_id: i64,
        shard_id: &str,
        read_only: bool,
    ) -> RouterResult<Endpoint> {
        let ctx = TenantContext::for_tenant(tenant_id, shard_id).read_only(read_only);
        self.choose_for(&ctx, true)
    }
}
