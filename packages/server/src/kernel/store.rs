//! State store gateway.
//!
//! Typed operations over the keyed job state: records, idempotency
//! bindings, cancel flags, the in-progress set and counter metrics.
//! Transient store failures surface as [`StoreError::Retryable`], permanent
//! ones as [`StoreError::Fatal`]; the gateway itself never retries.
//!
//! Status-transition enforcement lives here: every status write is a
//! compare-and-set over [`JobStatus::allowed_sources`], so a terminal state
//! can be written at most once per record no matter how many workers race.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;

use super::jobs::{JobError, JobRecord, JobResult, JobStatus, SubmissionParams};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient failure; the caller may retry.
    #[error("transient state store failure: {0}")]
    Retryable(anyhow::Error),
    /// Permanent failure.
    #[error("state store failure: {0}")]
    Fatal(anyhow::Error),
}

/// Partial update of a job record.
///
/// A `status` of `Some(target)` makes the write conditional on the record
/// currently holding one of `JobStatus::allowed_sources(target)`; with no
/// status change the write requires a non-terminal record. Progress only
/// ever moves forward.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub progress_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    pub engine_prompt_id: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Statuses the record may currently hold for this update to apply.
    pub fn allowed_sources(&self) -> &'static [JobStatus] {
        match self.status {
            Some(target) => JobStatus::allowed_sources(target),
            None => JobStatus::non_terminal(),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a fresh record. Fails if the job id is already present.
    async fn create_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Apply a partial update under the transition compare-and-set.
    /// Returns `false` when the record was absent or the CAS rejected the
    /// write.
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool, StoreError>;

    /// Create-if-absent binding `(owner, key) -> job_id`. Returns whether
    /// this write won.
    async fn set_idempotency(
        &self,
        owner: &str,
        key: &str,
        job_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn get_idempotency(&self, owner: &str, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_cancel_flag(&self, job_id: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, StoreError>;
    async fn clear_cancel_flag(&self, job_id: &str) -> Result<(), StoreError>;

    async fn mark_in_progress(&self, job_id: &str) -> Result<(), StoreError>;
    async fn unmark_in_progress(&self, job_id: &str) -> Result<(), StoreError>;
    async fn list_in_progress(&self) -> Result<Vec<String>, StoreError>;

    /// Bump a counter metric; `key` is a rendered `name{label="v"}` string.
    async fn increment_metric(&self, key: &str) -> Result<(), StoreError>;
    async fn list_metrics(&self) -> Result<Vec<(String, i64)>, StoreError>;

    /// Mark overdue non-terminal records as `expired` and drop overdue
    /// terminal records and expired flags/bindings. Returns the number of
    /// records newly marked expired.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn health_check(&self) -> bool;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresJobStore {
    pool: PgPool,
    record_ttl: Duration,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    owner_token: String,
    idempotency_key: String,
    params: Json<SubmissionParams>,
    status: JobStatus,
    progress: f64,
    progress_message: Option<String>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<Json<JobResult>>,
    error: Option<Json<JobError>>,
    engine_prompt_id: Option<String>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            job_id: row.job_id,
            owner: row.owner_token,
            idempotency_key: row.idempotency_key,
            params: row.params.0,
            status: row.status,
            progress: row.progress,
            progress_message: row.progress_message,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            result: row.result.map(|json| json.0),
            error: row.error.map(|json| json.0),
            engine_prompt_id: row.engine_prompt_id,
        }
    }
}

const JOB_COLUMNS: &str = "job_id, owner_token, idempotency_key, params, status, progress, \
     progress_message, queued_at, started_at, finished_at, result, error, engine_prompt_id";

impl PostgresJobStore {
    pub fn new(pool: PgPool, record_ttl: Duration) -> Self {
        Self { pool, record_ttl }
    }

    fn record_expiry(&self) -> DateTime<Utc> {
        expiry_from_now(self.record_ttl)
    }
}

fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
    Utc::now() + ttl
}

fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Retryable(err.into())
        }
        _ => StoreError::Fatal(err.into()),
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, owner_token, idempotency_key, params, status, progress,
                queued_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.owner)
        .bind(&record.idempotency_key)
        .bind(Json(&record.params))
        .bind(record.status)
        .bind(record.progress)
        .bind(record.queued_at)
        .bind(self.record_expiry())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(JobRecord::from))
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool, StoreError> {
        let allowed = update.allowed_sources().to_vec();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = COALESCE($2, status),
                progress = GREATEST(progress, COALESCE($3, progress)),
                progress_message = COALESCE($4, progress_message),
                started_at = COALESCE(started_at, $5),
                finished_at = COALESCE(finished_at, $6),
                result = COALESCE($7, result),
                error = COALESCE($8, error),
                engine_prompt_id = COALESCE($9, engine_prompt_id),
                expires_at = $10
            WHERE job_id = $1 AND status = ANY($11)
            "#,
        )
        .bind(job_id)
        .bind(update.status)
        .bind(update.progress)
        .bind(update.progress_message)
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(update.result.map(Json))
        .bind(update.error.map(Json))
        .bind(update.engine_prompt_id)
        .bind(self.record_expiry())
        .bind(allowed)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_idempotency(
        &self,
        owner: &str,
        key: &str,
        job_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (owner_token, idem_key, job_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (owner_token, idem_key) DO UPDATE
                SET job_id = EXCLUDED.job_id, expires_at = EXCLUDED.expires_at
                WHERE idempotency_keys.expires_at < NOW()
            "#,
        )
        .bind(owner)
        .bind(key)
        .bind(job_id)
        .bind(expiry_from_now(ttl))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_idempotency(&self, owner: &str, key: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT job_id FROM idempotency_keys
            WHERE owner_token = $1 AND idem_key = $2 AND expires_at > NOW()
            "#,
        )
        .bind(owner)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)
    }

    async fn set_cancel_flag(&self, job_id: &str, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_cancel_flags (job_id, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(job_id)
        .bind(expiry_from_now(ttl))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM job_cancel_flags
                WHERE job_id = $1 AND expires_at > NOW()
            )
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn clear_cancel_flag(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_cancel_flags WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn mark_in_progress(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs_in_progress (job_id)
            VALUES ($1)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn unmark_in_progress(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs_in_progress WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn list_in_progress(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT job_id FROM jobs_in_progress ORDER BY marked_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    async fn increment_metric(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_metrics (metric_key, value)
            VALUES ($1, 1)
            ON CONFLICT (metric_key) DO UPDATE SET value = job_metrics.value + 1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn list_metrics(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT metric_key, value FROM job_metrics ORDER BY metric_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'expired', finished_at = $1, expires_at = $2
            WHERE expires_at < $1 AND status = ANY($3)
            "#,
        )
        .bind(now)
        .bind(self.record_expiry())
        .bind(JobStatus::non_terminal().to_vec())
        .execute(&self.pool)
        .await
        .map_err(classify)?
        .rows_affected();

        sqlx::query("DELETE FROM jobs WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        sqlx::query("DELETE FROM job_cancel_flags WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(expired)
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_with_terminal_status_restricts_sources() {
        let update = JobUpdate::status(JobStatus::Succeeded);
        let sources = update.allowed_sources();
        assert!(sources.contains(&JobStatus::Running));
        assert!(!sources.contains(&JobStatus::Queued));
        assert!(!sources.contains(&JobStatus::Succeeded));
    }

    #[test]
    fn update_without_status_requires_non_terminal_record() {
        let update = JobUpdate {
            progress: Some(0.5),
            ..Default::default()
        };
        assert_eq!(update.allowed_sources(), JobStatus::non_terminal());
    }
}
