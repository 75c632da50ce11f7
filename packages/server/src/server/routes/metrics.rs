//! Prometheus text exposition of the store-backed counters.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::common::ApiError;
use crate::kernel::metrics;
use crate::server::app::AppState;

pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = metrics::render(state.store.as_ref()).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
