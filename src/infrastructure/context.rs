// Tenant context - the ambient per-request value naming which tenant (and
// hence which physical source) subsequent SQL belongs to. Stored in a
// task-local stack: set pushes, clear pops, leaving a scope tears down
// whatever the request left behind.

use std::cell::RefCell;
use std::future::Future;
use std::time::Instant;
use tokio::task_local;

use crate::error::{RouterError, RouterResult};
use crate::infrastructure::directory::TenantId;
use crate::infrastructure::pool_set::Endpoint;
use crate::infrastructure::shard_registry::ShardId;

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Option<TenantId>,
    pub shard_id: Option<ShardId>,
    pub read_only: bool,
    /// Physical source resolved when the context was installed. Routing
    /// honors it for the rest of the request.
    pub selected_source: Option<Endpoint>,
    /// Cooperative cancellation: routing, cache, and validation abort once
    /// this passes.
    pub deadline: Option<Instant>,
}

impl TenantContext {
    /// Context with no tenant: all access routes to the global database.
    pub fn empty() -> Self {
        Self {
            tenant_id: None,
            shard_id: None,
            read_only: false,
            selected_source: None,
            deadline: None,
        }
    }

    pub fn for_tenant(tenant_id: TenantId, shard_id: impl Into<ShardId>) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            shard_id: Some(shard_id.into()),
            read_only: false,
            selected_source: None,
            deadline: None,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_source(mut self, endpoint: Endpoint) -> Self {
        self.selected_source = Some(endpoint);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn has_tenant(&self) -> bool {
        self.tenant_id.is_some()
    }

    pub fn check_deadline(&self) -> RouterResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(RouterError::Deadline),
            _ => Ok(()),
        }
    }
}

task_local! {
    static CONTEXT_STACK: RefCell<Vec<TenantContext>>;
}

/// Establish the ambient cell for a request (or any task). Everything the
/// wrapped future sets is gone once the scope ends - the guaranteed-finally
/// teardown at request exit.
pub async fn scope<F>(f: F) -> F::Output
where
    F: Future,
{
    CONTEXT_STACK.scope(RefCell::new(Vec::new()), f).await
}

/// Run `f` with `ctx` installed as the current context, restoring whatever
/// was visible before once `f` completes. This is the explicit propagation
/// primitive for work handed to other tasks.
pub async fn execute_in_tenant_context<F>(ctx: TenantContext, f: F) -> F::Output
where
    F: Future,
{
    CONTEXT_STACK.scope(RefCell::new(vec![ctx]), f).await
}

/// The currently visible context. O(1); `None` outside any scope or when
/// nothing is installed.
pub fn current() -> Option<TenantContext> {
    CONTEXT_STACK
        .try_with(|stack| stack.borrow().last().cloned())
        .ok()
        .flatten()
}

/// Install a context. Re-entrant: an existing context is shadowed, not
/// replaced, and `clear` restores it.
pub fn set(ctx: TenantContext) -> RouterResult<()> {
    CONTEXT_STACK
        .try_with(|stack| stack.borrow_mut().push(ctx))
        .map_err(|_| {
            RouterError::Configuration(
                "TenantContext::set outside a context scope".to_string(),
            )
        })
}

/// Remove the current context, restoring the previously visible one.
/// Returns what was removed.
pub fn clear() -> Option<TenantContext> {
    CONTEXT_STACK
        .try_with(|stack| stack.borrow_mut().pop())
        .ok()
        .flatten()
}

/// Depth of the context stack; diagnostic only.
pub fn depth() -> usize {
    CONTEXT_STACK.try_with(|stack| stack.borrow().len()).unwrap_or(0)
}
