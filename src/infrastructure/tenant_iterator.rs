// Tenant iterator - sweep every tenant (optionally narrowed to a shard or
// region), running a caller-supplied function under each tenant's context
// on a bounded worker pool. Failures are collected, never fatal.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::ShardStatus;
use crate::error::{RouterError, RouterResult};
use crate::infrastructure::context::{self, TenantContext};
use crate::infrastructure::directory::{DirectoryStore, TenantId};
use crate::infrastructure::router::ConnectionRouter;

#[derive(Debug, Clone)]
pub struct IterationOptions {
    pub shard_filter: Option<String>,
    pub region_filter: Option<String>,
    pub batch_size: u32,
}

impl Default for IterationOptions {
    fn default() -> Self {
        Self {
            shard_filter: None,
            region_filter: None,
            batch_size: 500,
        }
    }
}

#[derive(Debug)]
pub struct TenantFailure {
    pub tenant_id: TenantId,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct IterationSummary {
    pub succeeded: u64,
    pub failed: Vec<TenantFailure>,
    /// Tenants whose mapping is disabled; enumerated but not processed.
    pub skipped: u64,
}

impl IterationSummary {
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed.len() as u64
    }
}

pub struct TenantIterator {
    store: Arc<dyn DirectoryStore>,
    router: Arc<ConnectionRouter>,
}

impl TenantIterator {
    pub fn new(store: Arc<dyn DirectoryStore>, router: Arc<ConnectionRouter>) -> Self {
        Self { store, router }
    }

    /// Run `f(tenant_id)` for every tenant, `parallelism` at a time. Each
    /// invocation sees that tenant's context installed, torn down when the
    /// invocation ends whatever the outcome. Per-tenant errors land in the
    /// summary and do not abort the sweep.
    pub async fn process_all_tenants<F, Fut>(
        &self,
        f: F,
        parallelism: usize,
        options: IterationOptions,
    ) -> RouterResult<IterationSummary>
    where
        F: Fn(TenantId) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = RouterResult<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut tasks: JoinSet<(TenantId, RouterResult<()>)> = JoinSet::new();
        let mut summary = IterationSummary::default();
        let mut cursor: Option<TenantId> = None;

        loop {
            let page = match &options.shard_filter {
                Some(shard_id) => {
                    self.store
                        .iterate_by_shard(shard_id, cursor, options.batch_size)
                        .await?
                }
                None => self.store.iterate_all(cursor, options.batch_size).await?,
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.tenant_id);

            for mapping in page {
                if let Some(region) = &options.region_filter {
                    if mapping.region.as_deref() != Some(region.as_str()) {
                        continue;
                    }
                }
                if mapping.status == ShardStatus::Disabled {
                    debug!("Skipping disabled tenant {}", mapping.tenant_id);
                    summary.skipped += 1;
                    continue;
                }

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("iterator semaphore closed");
                let f = f.clone();
                let router = Arc::clone(&self.router);
                tasks.spawn(async move {
                    let _permit = permit;
                    let tenant_id = mapping.tenant_id;
                    let result = async {
                        let source =
                            router.resolve_source(tenant_id, &mapping.shard_id, false)?;
                        let ctx = TenantContext::for_tenant(tenant_id, mapping.shard_id.clone())
                            .with_source(source);
                        match AssertUnwindSafe(context::execute_in_tenant_context(
                            ctx,
                            f(tenant_id),
                        ))
                        .catch_unwind()
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(RouterError::Database(anyhow::anyhow!(
                                "tenant task panicked"
                            ))),
                        }
                    }
                    .await;
                    (tenant_id, result)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => summary.succeeded += 1,
                Ok((tenant_id, Err(err))) => {
                    debug!("Tenant {} failed: {}", tenant_id, err);
                    summary.failed.push(TenantFailure {
                        tenant_id,
                        error: err.to_string(),
                    });
                }
                Err(join_err) => {
                    // Cancellation; the per-task panic guard means no
                    // tenant id is lost here in practice.
                    error!("Tenant task join error: {}", join_err);
                }
            }
        }

        info!(
            "Tenant sweep done: {} succeeded, {} failed, {} skipped",
            summary.succeeded,
            summary.failed.len(),
            summary.skipped
        );
        Ok(summary)
    }
}
