// Worker process: dequeues jobs, drives the engine, uploads artifacts.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use render_core::kernel::engine::{ComfyClient, EngineClient, WorkflowTemplate};
use render_core::kernel::events::{EventBus, LocalEventBus, NatsEventBus};
use render_core::kernel::jobs::{WorkerConfig, WorkerPool};
use render_core::kernel::queue::{JobQueue, PostgresJobQueue};
use render_core::kernel::storage::{ArtifactStore, S3ArtifactStore};
use render_core::kernel::store::{JobStore, PostgresJobStore};
use render_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,render_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting render worker");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

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
                "NATS_URL not set; progress events will not reach other processes"
            );
            Arc::new(LocalEventBus::new())
        }
    };

    let workflow = match &config.workflow_path {
        Some(path) => WorkflowTemplate::load(Path::new(path))?,
        None => WorkflowTemplate::builtin(),
    };
    let engine: Arc<dyn EngineClient> = Arc::new(
        ComfyClient::new(
            config.engine_url.clone(),
            config.engine_timeout,
            config.engine_poll_interval,
            workflow,
        )
        .context("Failed to create engine client")?,
    );

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(S3ArtifactStore::new(
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
        &config.s3_region,
        config.s3_bucket.clone(),
    ));
    artifacts
        .ensure_bucket()
        .await
        .context("Failed to ensure artifact bucket")?;

    let worker_config = WorkerConfig {
        concurrency: config.worker_concurrency,
        dequeue_timeout: config.dequeue_timeout,
        publish_window: config.publish_window,
        artifact_url_ttl: config.artifact_url_ttl,
        cancel_flag_ttl: config.cancel_flag_ttl,
        recovery: config.recovery_policy,
        ..Default::default()
    };
    let worker = Arc::new(WorkerPool::new(
        store, queue, engine, artifacts, bus, worker_config,
    ));

    // Resolve whatever a previous incarnation left in the in-progress set.
    worker.recover().await.context("Recovery sweep failed")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    worker.run(shutdown).await
}
