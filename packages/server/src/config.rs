use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::kernel::jobs::RecoveryPolicy;

/// Application configuration loaded from environment variables.
///
/// Shared by the API server and the worker binary; each reads the subset
/// it needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// NATS server for cross-process progress pub/sub. When unset, both
    /// binaries fall back to the in-process event bus (single-process
    /// deployments only).
    pub nats_url: Option<String>,
    pub port: u16,
    /// Namespace prefix for pub/sub subjects and metric keys.
    pub namespace: String,

    // Engine (image generation backend)
    pub engine_url: String,
    pub engine_timeout: Duration,
    pub engine_poll_interval: Duration,
    pub workflow_path: Option<String>,
    pub default_model: String,

    // Object storage
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub artifact_url_ttl: Duration,

    // Worker
    pub worker_concurrency: usize,
    pub queue_visibility: Duration,
    pub dequeue_timeout: Duration,
    pub publish_window: Duration,
    pub recovery_policy: RecoveryPolicy,

    // TTLs
    pub record_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub cancel_flag_ttl: Duration,

    // API
    pub submit_timeout: Duration,
    pub auth_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL").ok(),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            namespace: env::var("STORE_NAMESPACE").unwrap_or_else(|_| "app".to_string()),

            engine_url: env::var("ENGINE_URL")
                .unwrap_or_else(|_| "http://localhost:8188".to_string()),
            engine_timeout: duration_from_env("ENGINE_TIMEOUT_SECS", 1200)?,
            engine_poll_interval: duration_from_env("ENGINE_POLL_INTERVAL_SECS", 1)?,
            workflow_path: env::var("WORKFLOW_PATH").ok(),
            default_model: env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| "sd_xl_base_1.0.safetensors".to_string()),

            s3_endpoint: env::var("S3_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            s3_access_key: env::var("S3_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".to_string()),
            s3_secret_key: env::var("S3_SECRET_KEY").unwrap_or_else(|_| "minioadmin".to_string()),
            s3_region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            s3_bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "render-artifacts".to_string()),
            artifact_url_ttl: duration_from_env("ARTIFACT_URL_TTL_SECS", 3600)?,

            worker_concurrency: env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("WORKER_CONCURRENCY must be a valid number")?,
            queue_visibility: duration_from_env("QUEUE_VISIBILITY_SECS", 1800)?,
            dequeue_timeout: duration_from_env("DEQUEUE_TIMEOUT_SECS", 5)?,
            publish_window: Duration::from_millis(
                env::var("PUBLISH_WINDOW_MS")
                    .unwrap_or_else(|_| "200".to_string())
                    .parse()
                    .context("PUBLISH_WINDOW_MS must be a valid number")?,
            ),
            recovery_policy: env::var("WORKER_RECOVERY_POLICY")
                .unwrap_or_else(|_| "reenqueue".to_string())
                .parse()
                .context("WORKER_RECOVERY_POLICY must be 'reenqueue' or 'fail_fast'")?,

            record_ttl: duration_from_env("JOB_RECORD_TTL_SECS", 86_400)?,
            idempotency_ttl: duration_from_env("IDEMPOTENCY_TTL_SECS", 86_400)?,
            cancel_flag_ttl: duration_from_env("CANCEL_FLAG_TTL_SECS", 3600)?,

            submit_timeout: duration_from_env("SUBMIT_TIMEOUT_SECS", 10)?,
            auth_enabled: bool_from_env("AUTH_ENABLED", false)?,
            rate_limit_enabled: bool_from_env("RATE_LIMIT_ENABLED", false)?,
            rate_limit_per_second: env::var("RATE_LIMIT_PER_SECOND")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("RATE_LIMIT_PER_SECOND must be a valid number")?,
            rate_limit_burst: env::var("RATE_LIMIT_BURST")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("RATE_LIMIT_BURST must be a valid number")?,
        })
    }
}

fn duration_from_env(var: &str, default_secs: u64) -> Result<Duration> {
    let secs = env::var(var)
        .unwrap_or_else(|_| default_secs.to_string())
        .parse()
        .with_context(|| format!("{var} must be a number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

fn bool_from_env(var: &str, default: bool) -> Result<bool> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{var} must be 'true' or 'false'")),
        Err(_) => Ok(default),
    }
}
