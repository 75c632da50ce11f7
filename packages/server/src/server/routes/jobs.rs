//! Job submission, query and cancellation endpoints.

use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::common::id::is_valid_job_id;
use crate::common::{ApiError, ApiJson};
use crate::kernel::jobs::{JobStatus, JobView, SubmissionParams};
use crate::server::app::AppState;
use crate::server::middleware::Owner;

fn job_not_found(job_id: &str) -> ApiError {
    ApiError::NotFound(format!("job {job_id}"))
}

/// `POST /api/v1/jobs` — submit a generation job.
///
/// Returns 202 with a receipt for both fresh submissions and idempotent
/// replays; the `Location` header points at the status endpoint. An
/// `Idempotency-Key` header overrides the computed content fingerprint.
pub async fn create_job_handler(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    headers: HeaderMap,
    ApiJson(params): ApiJson<SubmissionParams>,
) -> Result<Response, ApiError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let receipt = state
        .submissions
        .submit(params, &owner.0, idempotency_key)
        .await?;

    let location = receipt.location.clone();
    let mut response = (StatusCode::ACCEPTED, Json(receipt)).into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

/// `GET /api/v1/jobs/{id}` — current state of one job.
pub async fn get_job_handler(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    if !is_valid_job_id(&job_id) {
        return Err(job_not_found(&job_id));
    }
    let job = state
        .store
        .get_job(&job_id)
        .await?
        .ok_or_else(|| job_not_found(&job_id))?;

    let is_owner = job.owner == owner.0;
    Ok(Json(job.view(is_owner)))
}

#[derive(Debug, Serialize)]
pub struct JobCancelResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// `DELETE /api/v1/jobs/{id}` — request cancellation.
///
/// 202 because cancellation of a running job is asynchronous: the worker
/// converges at its next checkpoint.
pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    if !is_valid_job_id(&job_id) {
        return Err(job_not_found(&job_id));
    }
    let outcome = state
        .cancellations
        .cancel(&job_id)
        .await?
        .ok_or_else(|| job_not_found(&job_id))?;

    let message = if outcome.accepted {
        "Cancellation requested".to_string()
    } else {
        format!("Job cannot be cancelled (current status: {})", outcome.status)
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(JobCancelResponse {
            job_id: outcome.job_id,
            status: outcome.status,
            message,
        }),
    )
        .into_response())
}
