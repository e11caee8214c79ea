//! Health and admin endpoints for worker processes.
//!
//! Reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`) backed by a store ping
//! - Queue status (`/queue/status`)
//! - Worker liveness summary (`/workers`)
//! - Prometheus metrics (`/metrics`)
//! - DLQ admin (`/admin/dlq`, `/admin/dlq/stats`)

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use store::StoreClient;

use crate::dlq::DlqManager;
use crate::heartbeat::liveness_summary;
use crate::ingress::Ingress;
use crate::metrics;

/// Shared state for the health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub store: StoreClient,
    pub ingress: Ingress,
    pub dlq: DlqManager,
    pub app_name: String,
    pub app_version: String,
    pub heartbeat_period_secs: u64,
    pub heartbeat_ttl_factor: u32,
}

/// Liveness probe handler. Always OK if the process is serving.
pub async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

/// Readiness probe handler: verifies the store answers PING.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.store.ping().await {
        Ok(latency) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "store": "ok",
                    "store_latency_ms": latency.as_millis() as u64,
                }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "store": format!("error: {}", e) }
            })),
        )),
    }
}

/// Queue depths, state counters, and the adaptive retry ratio.
pub async fn queue_status_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.ingress.queue_status().await {
        Ok(status) => {
            metrics::set_queue_depths(&status.snapshot.depths);
            Ok(Json(json!(status)))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        )),
    }
}

/// Liveness summary over all workers' heartbeats.
pub async fn workers_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match liveness_summary(
        &state.store,
        state.heartbeat_period_secs,
        state.heartbeat_ttl_factor,
    )
    .await
    {
        Ok(summary) => Ok(Json(json!(summary))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        )),
    }
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder not initialized\n".to_string(),
        ),
    }
}

/// DLQ statistics.
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.dlq.stats().await {
        Ok(stats) => Ok(Json(json!(stats))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    #[serde(default = "default_dlq_limit")]
    pub limit: usize,
}

fn default_dlq_limit() -> usize {
    50
}

/// List dead-lettered tasks, newest first.
pub async fn dlq_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.dlq.list(params.limit.min(500)).await {
        Ok(entries) => Ok(Json(json!({
            "count": entries.len(),
            "entries": entries,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        )),
    }
}

/// Health-only router (liveness + readiness + metrics + queue status).
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/status", get(queue_status_handler))
        .route("/workers", get(workers_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health plus DLQ admin endpoints in one router.
pub fn full_admin_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/status", get(queue_status_handler))
        .route("/workers", get(workers_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq", get(dlq_list_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_list_params_default() {
        let params: DlqListParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.limit, 50);
    }
}
