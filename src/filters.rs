// Request filters - the ingress boundary. `shard_selector` resolves the
// tenant named by the account-id header and installs a fully resolved
// context; `tenant_validator` re-checks the installed context against the
// header. The context scope ends with the request on every path, so
// teardown cannot be skipped.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::error::{RouterError, RouterResult};
use crate::infrastructure::context::{self, TenantContext};
use crate::infrastructure::directory::TenantId;
use crate::infrastructure::factory::ShardRouterSystem;

/// Canonical tenant header. A string parseable to a 64-bit integer.
pub const ACCOUNT_ID_HEADER: &str = "account-id";

/// Attach both filters to an axum router, ordered selector-then-validator.
pub fn install(router: axum::Router, system: Arc<ShardRouterSystem>) -> axum::Router {
    router
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&system),
            tenant_validator,
        ))
        .layer(axum::middleware::from_fn_with_state(system, shard_selector))
}

fn is_excluded(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

fn parse_account_id(headers: &HeaderMap) -> RouterResult<Option<TenantId>> {
    let Some(raw) = headers.get(ACCOUNT_ID_HEADER) else {
        return Ok(None);
    };
    let text = raw.to_str().map_err(|_| {
        RouterError::BadRequest(format!("{} header is not valid text", ACCOUNT_ID_HEADER))
    })?;
    let tenant_id = text.trim().parse::<i64>().map_err(|_| {
        RouterError::BadRequest(format!(
            "{} header '{}' is not a 64-bit integer",
            ACCOUNT_ID_HEADER, text
        ))
    })?;
    Ok(Some(tenant_id))
}

async fn resolve_context(
    system: &ShardRouterSystem,
    tenant_id: Option<TenantId>,
    method: &Method,
) -> RouterResult<TenantContext> {
    let Some(tenant_id) = tenant_id else {
        // No header: global-only request.
        return Ok(TenantContext::empty());
    };

    let mapping = system
        .lookup
        .find_shard_by_tenant_id(tenant_id)
        .await?
        .ok_or(RouterError::UnknownTenant(tenant_id))?;

    if mapping.status == crate::config::ShardStatus::Disabled {
        return Err(RouterError::ShardDisabled(mapping.shard_id));
    }

    let read_only = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
    let source = system
        .router
        .resolve_source(tenant_id, &mapping.shard_id, read_only)?;

    Ok(TenantContext::for_tenant(tenant_id, mapping.shard_id)
        .read_only(read_only)
        .with_source(source))
}

/// First filter: parse the tenant header, resolve its shard, install the
/// context for the rest of the request.
pub async fn shard_selector(
    State(system): State<Arc<ShardRouterSystem>>,
    request: Request,
    next: Next,
) -> Response {
    if is_excluded(request.uri().path(), &system.config.excluded_paths) {
        return next.run(request).await;
    }

    let request_id = Uuid::new_v4();
    let span = tracing::debug_span!("request", %request_id);

    context::scope(
        async move {
            let tenant_id = match parse_account_id(request.headers()) {
                Ok(tenant_id) => tenant_id,
                Err(err) => return err.into_response(),
            };
            let ctx = match resolve_context(&system, tenant_id, request.method()).await {
                Ok(ctx) => ctx,
                Err(err) => return err.into_response(),
            };

            debug!("Installing context for tenant {:?}", ctx.tenant_id);
            use std::sync::atomic::Ordering;
            system.metrics.contexts_installed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = context::set(ctx) {
                return err.into_response();
            }

            let response = next.run(request).await;
            context::clear();
            response
        }
        .instrument(span),
    )
    .await
}

/// Second filter: the header must agree with the installed context.
pub async fn tenant_validator(
    State(system): State<Arc<ShardRouterSystem>>,
    request: Request,
    next: Next,
) -> Response {
    if is_excluded(request.uri().path(), &system.config.excluded_paths) {
        return next.run(request).await;
    }

    let header_tenant = match parse_account_id(request.headers()) {
        Ok(tenant_id) => tenant_id,
        Err(err) => return err.into_response(),
    };
    let context_tenant = context::current().and_then(|ctx| ctx.tenant_id);

    if header_tenant != context_tenant {
        return RouterError::Configuration(format!(
            "tenant context mismatch: header {:?}, context {:?}",
            header_tenant, context_tenant
        ))
        .into_response();
    }

    next.run(request).await
}
