//! Health endpoints.
//!
//! `/healthz` is a bare liveness probe with no external calls. `/health`
//! checks the state store, the queue and the engine with bounded timeouts
//! and returns 503 when any of them is down.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    engine: String,
    store: String,
    queue: String,
}

fn component(ok: bool) -> String {
    if ok { "ok" } else { "error" }.to_string()
}

async fn bounded(probe: impl std::future::Future<Output = bool>, limit: Duration) -> bool {
    tokio::time::timeout(limit, probe).await.unwrap_or(false)
}

pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let store_ok = bounded(state.store.health_check(), Duration::from_secs(5)).await;
    let queue_ok = bounded(state.queue.health_check(), Duration::from_secs(5)).await;
    let engine_ok = bounded(state.engine.health_check(), Duration::from_secs(5)).await;

    let healthy = store_ok && queue_ok && engine_ok;
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            engine: component(engine_ok),
            store: component(store_ok),
            queue: component(queue_ok),
        }),
    )
}

/// Liveness check with no external dependencies (for container probes).
pub async fn liveness_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive" }))
}
