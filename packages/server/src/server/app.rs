//! Application setup and router configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::engine::EngineClient;
use crate::kernel::events::EventBus;
use crate::kernel::jobs::{CancellationService, SubmissionService};
use crate::kernel::queue::JobQueue;
use crate::kernel::store::JobStore;
use crate::server::middleware::{owner_middleware, propagate_request_id};
use crate::server::routes::{
    cancel_job_handler, create_job_handler, get_job_handler, health_handler, job_events_handler,
    liveness_handler, metrics_handler,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub engine: Arc<dyn EngineClient>,
    pub bus: Arc<dyn EventBus>,
    pub submissions: Arc<SubmissionService>,
    pub cancellations: Arc<CancellationService>,
}

/// Router knobs lifted out of [`crate::Config`] so tests can build an app
/// without an environment.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub auth_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    /// Submission handlers are bounded; the streaming endpoint is not.
    pub submit_timeout: Duration,
    pub body_limit_bytes: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            auth_enabled: false,
            rate_limit_enabled: false,
            rate_limit_per_second: 10,
            rate_limit_burst: 20,
            submit_timeout: Duration::from_secs(10),
            body_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Build the axum application router.
pub fn build_app(state: AppState, options: AppOptions) -> Router {
    // Request/response endpoints get the bounded timeout; the SSE stream
    // must outlive it and is mounted separately.
    let jobs_api = Router::new()
        .route("/jobs", post(create_job_handler))
        .route(
            "/jobs/:job_id",
            get(get_job_handler).delete(cancel_job_handler),
        )
        .layer(TimeoutLayer::new(options.submit_timeout));

    let stream_api = Router::new().route("/jobs/:job_id/events", get(job_events_handler));

    let auth_enabled = options.auth_enabled;
    let api = jobs_api.merge(stream_api).layer(middleware::from_fn(
        move |request, next| owner_middleware(auth_enabled, request, next),
    ));

    let mut router = Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler));

    // Rate limiting per client IP; adds x-ratelimit-* headers and
    // Retry-After on 429. Requires connect info on the served app.
    if options.rate_limit_enabled {
        let governor_config = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(options.rate_limit_per_second)
                .burst_size(options.rate_limit_burst)
                .use_headers()
                .finish()
                .expect("rate limiter configuration is valid and should never fail"),
        );
        router = router.layer(GovernorLayer {
            config: governor_config,
        });
    }

    router
        .layer(DefaultBodyLimit::max(options.body_limit_bytes))
        .layer(middleware::from_fn(propagate_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
