//! Durable job queue with lease-based visibility timeouts.
//!
//! Best-effort FIFO of job ids. A dequeued item is held under a lease; if
//! the worker neither acks nor nacks before the lease expires, the item
//! becomes visible again and is re-delivered. Duplicate delivery is
//! therefore possible and the worker's terminal-write compare-and-set is
//! what makes it harmless.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(anyhow::Error),
    #[error("queue failure: {0}")]
    Failed(anyhow::Error),
}

/// A dequeued item together with its lease handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    pub job_id: String,
    pub lease_id: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job id; returns once the write is durable.
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError>;

    /// Blocking pop with a short poll. Returns `None` when nothing became
    /// available within `timeout`.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<LeasedJob>, QueueError>;

    /// Acknowledge a delivered item; it will never be delivered again.
    async fn ack(&self, lease: &LeasedJob) -> Result<(), QueueError>;

    /// Give an item back. With `requeue` it becomes immediately visible,
    /// otherwise it is dropped.
    async fn nack(&self, lease: &LeasedJob, requeue: bool) -> Result<(), QueueError>;

    /// Release expired leases so their items are re-delivered. Returns the
    /// number of reaped items.
    async fn reap(&self) -> Result<u64, QueueError>;

    /// Number of items currently visible to consumers.
    async fn depth(&self) -> Result<i64, QueueError>;

    async fn health_check(&self) -> bool;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresJobQueue {
    pool: PgPool,
    visibility: Duration,
    poll_interval: Duration,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, visibility: Duration) -> Self {
        Self {
            pool,
            visibility,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Claim a single item, also picking up items whose lease expired.
    async fn claim_one(&self) -> Result<Option<LeasedJob>, QueueError> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r#"
            WITH next_item AS (
                SELECT id
                FROM job_queue
                WHERE available_at <= NOW()
                  AND (leased_until IS NULL OR leased_until < NOW())
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue q
            SET leased_until = NOW() + ($1 || ' milliseconds')::INTERVAL,
                delivery_count = q.delivery_count + 1
            FROM next_item
            WHERE q.id = next_item.id
            RETURNING q.id, q.job_id
            "#,
        )
        .bind(self.visibility.as_millis().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|(lease_id, job_id)| LeasedJob { job_id, lease_id }))
    }
}

fn classify(err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QueueError::Unavailable(err.into())
        }
        _ => QueueError::Failed(err.into()),
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO job_queue (job_id) VALUES ($1)")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leased) = self.claim_one().await? {
                return Ok(Some(leased));
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, lease: &LeasedJob) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(lease.lease_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn nack(&self, lease: &LeasedJob, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET leased_until = NULL, available_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(lease.lease_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        } else {
            self.ack(lease).await?;
        }

        Ok(())
    }

    async fn reap(&self) -> Result<u64, QueueError> {
        let reaped = sqlx::query(
            r#"
            UPDATE job_queue
            SET leased_until = NULL
            WHERE leased_until IS NOT NULL AND leased_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?
        .rows_affected();

        if reaped > 0 {
            tracing::warn!(count = reaped, "reaped orphaned queue items");
        }

        Ok(reaped)
    }

    async fn depth(&self) -> Result<i64, QueueError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM job_queue
            WHERE leased_until IS NULL OR leased_until < NOW()
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
