//! Operational endpoints served next to the proxy.
//!
//! * `GET /gateway/services` pools, breakers and cache statistics
//! * `GET /gateway/health` liveness summary over all instances
//! * `DELETE /gateway/cache` drop every cached response
//! * `DELETE /gateway/cache/{*prefix}` drop cached responses whose key starts with `prefix`
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
};
use serde::Serialize;

use crate::{
    adapters::router::GatewayRouter,
    core::gateway::{GatewaySnapshot, HealthSummary},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub summary: HealthSummary,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub removed: usize,
}

pub fn routes() -> Router<GatewayRouter> {
    Router::new()
        .route("/gateway/services", get(list_services))
        .route("/gateway/health", get(health))
        .route("/gateway/cache", delete(clear_cache))
        .route("/gateway/cache/{*prefix}", delete(clear_cache_prefix))
}

async fn list_services(State(router): State<GatewayRouter>) -> Json<GatewaySnapshot> {
    Json(router.gateway_service().snapshot().await)
}

async fn health(State(router): State<GatewayRouter>) -> impl IntoResponse {
    let summary: HealthSummary = router.gateway_service().health_summary();
    let status = if summary.healthy_instances > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            summary,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}

async fn clear_cache(State(router): State<GatewayRouter>) -> Json<CacheClearResponse> {
    let removed = router.gateway_service().cache().clear().await;
    Json(CacheClearResponse { removed })
}

async fn clear_cache_prefix(
    State(router): State<GatewayRouter>,
    Path(prefix): Path<String>,
) -> Json<CacheClearResponse> {
    let removed = router
        .gateway_service()
        .cache()
        .clear_by_prefix(&prefix)
        .await;
    Json(CacheClearResponse { removed })
}
