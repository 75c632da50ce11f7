//! Cancellation service.
//!
//! Queued jobs transition to `canceled` immediately; running jobs get a
//! cancel flag and become `canceling` until the worker converges. Repeat
//! cancels are no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::common::ApiError;
use crate::kernel::events::{EventBus, ProgressEvent};
use crate::kernel::metrics;
use crate::kernel::store::{JobStore, JobUpdate};

use super::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub job_id: String,
    pub status: JobStatus,
    /// Whether this call changed anything.
    pub accepted: bool,
}

pub struct CancellationService {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus>,
    cancel_flag_ttl: Duration,
}

impl CancellationService {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn EventBus>,
        cancel_flag_ttl: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            cancel_flag_ttl,
        }
    }

    /// Cancel a job. Returns `None` when the job does not exist.
    pub async fn cancel(&self, job_id: &str) -> Result<Option<CancelOutcome>, ApiError> {
        // A lost compare-and-set means a worker moved the job under us;
        // re-read once and dispatch on the fresh status.
        for _ in 0..2 {
            let Some(job) = self.store.get_job(job_id).await? else {
                return Ok(None);
            };

            match job.status {
                JobStatus::Queued => {
                    let update = JobUpdate {
                        status: Some(JobStatus::Canceled),
                        finished_at: Some(Utc::now()),
                        ..Default::default()
                    };
                    if !self.store.update_job(job_id, update).await? {
                        continue;
                    }
                    info!(job_id = %job_id, "canceled queued job");
                    let done = ProgressEvent::Done {
                        status: JobStatus::Canceled,
                        result: None,
                        error: None,
                    };
                    if let Err(error) = self.bus.publish(job_id, &done).await {
                        tracing::warn!(job_id = %job_id, %error, "failed to publish cancel event");
                    }
                    metrics::increment(
                        self.store.as_ref(),
                        "jobs_total",
                        &[("status", "canceled")],
                    )
                    .await;
                    return Ok(Some(CancelOutcome {
                        job_id: job_id.to_string(),
                        status: JobStatus::Canceled,
                        accepted: true,
                    }));
                }
                JobStatus::Running => {
                    self.store
                        .set_cancel_flag(job_id, self.cancel_flag_ttl)
                        .await?;
                    if !self
                        .store
                        .update_job(job_id, JobUpdate::status(JobStatus::Canceling))
                        .await?
                    {
                        continue;
                    }
                    info!(job_id = %job_id, "cancellation requested for running job");
                    return Ok(Some(CancelOutcome {
                        job_id: job_id.to_string(),
                        status: JobStatus::Canceling,
                        accepted: true,
                    }));
                }
                status => {
                    // Already canceling or terminal: idempotent no-op.
                    return Ok(Some(CancelOutcome {
                        job_id: job_id.to_string(),
                        status,
                        accepted: false,
                    }));
                }
            }
        }

        // Two lost races in a row: report the current state.
        let status = self
            .store
            .get_job(job_id)
            .await?
            .map(|job| job.status)
            .unwrap_or(JobStatus::Canceled);
        Ok(Some(CancelOutcome {
            job_id: job_id.to_string(),
            status,
            accepted: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::events::LocalEventBus;
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{JobRecord, SubmissionParams};
    use futures::StreamExt;

    fn record(job_id: &str) -> JobRecord {
        let params: SubmissionParams =
            serde_json::from_value(serde_json::json!({ "prompt": "a cat" })).unwrap();
        JobRecord::queued(job_id.to_string(), "tok".into(), "key".into(), params)
    }

    fn service(store: Arc<MemoryJobStore>, bus: Arc<LocalEventBus>) -> CancellationService {
        CancellationService::new(store, bus, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn cancel_missing_job_returns_none() {
        let store = Arc::new(MemoryJobStore::new());
        let svc = service(store, Arc::new(LocalEventBus::new()));
        assert!(svc.cancel("j_nosuchjobxx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_queued_job_is_immediate_and_publishes_done() {
        let store = Arc::new(MemoryJobStore::new());
        let bus = Arc::new(LocalEventBus::new());
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        let mut events = bus.subscribe("j_abcdefghijkl").await.unwrap();

        let svc = service(store.clone(), bus.clone());
        let outcome = svc.cancel("j_abcdefghijkl").await.unwrap().unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.status, JobStatus::Canceled);

        let job = store.get_job("j_abcdefghijkl").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.finished_at.is_some());

        let event = events.next().await.unwrap();
        assert!(event.is_done());
    }

    #[tokio::test]
    async fn cancel_running_job_sets_flag_and_canceling() {
        let store = Arc::new(MemoryJobStore::new());
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();

        let svc = service(store.clone(), Arc::new(LocalEventBus::new()));
        let outcome = svc.cancel("j_abcdefghijkl").await.unwrap().unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.status, JobStatus::Canceling);
        assert!(store.is_cancel_requested("j_abcdefghijkl").await.unwrap());
        let job = store.get_job("j_abcdefghijkl").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceling);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let store = Arc::new(MemoryJobStore::new());
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();

        let svc = service(store.clone(), Arc::new(LocalEventBus::new()));
        let first = svc.cancel("j_abcdefghijkl").await.unwrap().unwrap();
        let second = svc.cancel("j_abcdefghijkl").await.unwrap().unwrap();

        assert!(first.accepted);
        assert!(!second.accepted);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_a_noop() {
        let store = Arc::new(MemoryJobStore::new());
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();
        store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Succeeded))
            .await
            .unwrap();

        let svc = service(store.clone(), Arc::new(LocalEventBus::new()));
        let outcome = svc.cancel("j_abcdefghijkl").await.unwrap().unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.status, JobStatus::Succeeded);
        let job = store.get_job("j_abcdefghijkl").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
}
