// Main entry point for the API server

use std::sync::Arc;

use anyhow::{Context, Result};
use render_core::kernel::engine::{ComfyClient, EngineClient, WorkflowTemplate};
use render_core::kernel::events::{EventBus, LocalEventBus, NatsEventBus};
use render_core::kernel::jobs::{CancellationService, SubmissionService};
use render_core::kernel::queue::{JobQueue, PostgresJobQueue};
use render_core::kernel::store::{JobStore, PostgresJobStore};
use render_core::server::{build_app, AppOptions, AppState};
use render_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,render_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting render job API");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn JobStore> =
        Arc::new(PostgresJobStore::new(pool.clone(), config.record_ttl));
    let queue: Arc<dyn JobQueue> =
        Arc::new(PostgresJobQueue::new(pool.clone(), config.queue_visibility));

    let bus: Arc<dyn EventBus> = match &config.nats_url {
        Some(url) => {
            let client = async_nats::connect(url)
                .await
                .context("Failed to connect to NATS")?;
            tracing::info!(url = %url, "Connected to NATS");
            Arc::new(NatsEventBus::new(client, config.namespace.clone()))
        }
        None => {
            tracing::warn!(
                "NATS_URL not set; using the in-process event bus (single-process mode)"
            );
            Arc::new(LocalEventBus::new())
        }
    };

    // The server only probes the engine for /health; workers own generation.
    let engine: Arc<dyn EngineClient> = Arc::new(
        ComfyClient::new(
            config.engine_url.clone(),
            config.engine_timeout,
            config.engine_poll_interval,
            WorkflowTemplate::builtin(),
        )
        .context("Failed to create engine client")?,
    );

    let submissions = Arc::new(SubmissionService::new(
        store.clone(),
        queue.clone(),
        config.default_model.clone(),
        config.idempotency_ttl,
    ));
    let cancellations = Arc::new(CancellationService::new(
        store.clone(),
        bus.clone(),
        config.cancel_flag_ttl,
    ));

    let state = AppState {
        store,
        queue,
        engine,
        bus,
        submissions,
        cancellations,
    };
    let options = AppOptions {
        auth_enabled: config.auth_enabled,
        rate_limit_enabled: config.rate_limit_enabled,
        rate_limit_per_second: config.rate_limit_per_second,
        rate_limit_burst: config.rate_limit_burst,
        submit_timeout: config.submit_timeout,
        ..Default::default()
    };
    let app = build_app(state, options);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
