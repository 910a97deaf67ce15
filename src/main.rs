// Shard Router demo server - wires the routing system into an axum app
// with the tenant filters installed.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use shard_router::infrastructure::context;
use shard_router::{
    filters, EntityClass, RouterConfig, RouterResult, ShardRouterFactory, ShardRouterSystem,
    SqlParam,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RouterConfig::from_env()?;
    let system = Arc::new(
        ShardRouterFactory::new(config)
            .with_entities(vec![
                EntityClass::sharded("tickets", "account_id"),
                EntityClass::global("plans"),
            ])
            .build()
            .await?,
    );

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/signup/{tenant_id}", post(signup))
        .route("/tickets", get(list_tickets))
        .with_state(Arc::clone(&system));

    let app = filters::install(app, system).layer(CorsLayer::permissive());

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Shard router demo listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(system): State<Arc<ShardRouterSystem>>) -> Json<serde_json::Value> {
    let mut endpoints = serde_json::Map::new();
    for id in system.pools.endpoint_ids() {
        let healthy = system.pools.health_check(&id).await.is_ok();
        endpoints.insert(id.to_string(), serde_json::json!(healthy));
    }
    Json(serde_json::json!({ "status": "ok", "endpoints": endpoints }))
}

async fn metrics(State(system): State<Arc<ShardRouterSystem>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "router": system.metrics.snapshot(),
        "cache": system.cache.stats(),
    }))
}

/// Provision a tenant on the latest shard. Excluded from tenant
/// resolution: the tenant does not exist yet.
async fn signup(
    State(system): State<Arc<ShardRouterSystem>>,
    Path(tenant_id): Path<i64>,
) -> RouterResult<Json<serde_json::Value>> {
    let mapping = system.lookup.assign_tenant_to_latest_shard(tenant_id).await?;
    Ok(Json(serde_json::json!({
        "tenant_id": mapping.tenant_id,
        "shard_id": mapping.shard_id,
        "region": mapping.region,
    })))
}

/// Sample sharded read: routed to the caller tenant's shard and checked
/// for a tenant predicate by the validator.
async fn list_tickets(
    State(system): State<Arc<ShardRouterSystem>>,
) -> RouterResult<Json<serde_json::Value>> {
    let Some(tenant_id) = context::current().and_then(|ctx| ctx.tenant_id) else {
        return Err(shard_router::RouterError::MissingTenantContext);
    };

    let conn = system.data_source.acquire(Some("tickets"))?;
    let count = conn
        .fetch_scalar_i64(
            "SELECT COUNT(*) FROM tickets WHERE account_id = ?",
            &[SqlParam::I64(tenant_id)],
        )
        .await?;
    Ok(Json(serde_json::json!({
        "tenant_id": tenant_id,
        "tickets": count,
        "endpoint": conn.endpoint().id.to_string(),
    })))
}
