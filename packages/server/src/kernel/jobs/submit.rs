//! Submission service: idempotency fingerprints, job allocation, enqueue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::common::{new_job_id, ApiError};
use crate::kernel::metrics;
use crate::kernel::queue::JobQueue;
use crate::kernel::store::{JobStore, JobUpdate};

use super::job::{JobError, JobErrorKind, JobRecord, JobStatus, SubmissionParams};

/// What the client gets back from `POST /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub location: String,
}

impl SubmissionReceipt {
    fn for_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            queued_at: job.queued_at,
            location: format!("/api/v1/jobs/{}", job.job_id),
        }
    }
}

pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    default_model: String,
    idempotency_ttl: Duration,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        default_model: impl Into<String>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            default_model: default_model.into(),
            idempotency_ttl,
        }
    }

    /// Submit a generation request.
    ///
    /// Safe under concurrent submissions of the same `(owner, key)`: the
    /// create-if-absent idempotency write decides the winner and losers
    /// observe the winner's job.
    pub async fn submit(
        &self,
        mut params: SubmissionParams,
        owner: &str,
        idempotency_key: Option<String>,
    ) -> Result<SubmissionReceipt, ApiError> {
        params.validate()?;
        if params.model.is_none() {
            params.model = Some(self.default_model.clone());
        }

        let key = match idempotency_key {
            Some(key) if !key.trim().is_empty() => key.trim().to_string(),
            _ => fingerprint(&params, owner),
        };

        // One retry after losing the create-if-absent race.
        for _ in 0..2 {
            if let Some(existing_id) = self.store.get_idempotency(owner, &key).await? {
                match self.store.get_job(&existing_id).await? {
                    Some(job) => {
                        info!(job_id = %job.job_id, "idempotency hit, returning existing job");
                        return Ok(SubmissionReceipt::for_job(&job));
                    }
                    None => {
                        // The binding outlived its record. Adopt the dangling
                        // id so the binding becomes consistent again.
                        warn!(
                            job_id = %existing_id,
                            "idempotency binding points at a missing record, self-healing"
                        );
                        return self.create_and_enqueue(existing_id, owner, key, params).await;
                    }
                }
            }

            let job_id = new_job_id();
            if self
                .store
                .set_idempotency(owner, &key, &job_id, self.idempotency_ttl)
                .await?
            {
                return self.create_and_enqueue(job_id, owner, key, params).await;
            }
        }

        // Lost the race twice; surface the winner.
        if let Some(existing_id) = self.store.get_idempotency(owner, &key).await? {
            if let Some(job) = self.store.get_job(&existing_id).await? {
                return Ok(SubmissionReceipt::for_job(&job));
            }
        }
        Err(ApiError::Internal(anyhow::anyhow!(
            "idempotency binding kept racing"
        )))
    }

    async fn create_and_enqueue(
        &self,
        job_id: String,
        owner: &str,
        key: String,
        params: SubmissionParams,
    ) -> Result<SubmissionReceipt, ApiError> {
        let mut record = JobRecord::queued(job_id.clone(), owner.to_string(), key, params);

        if let Err(create_err) = self.store.create_job(&record).await {
            // A concurrent self-heal may have created the record first.
            if let Some(existing) = self.store.get_job(&job_id).await? {
                return Ok(SubmissionReceipt::for_job(&existing));
            }
            return Err(create_err.into());
        }
        info!(job_id = %job_id, "created job");

        if let Err(enqueue_err) = self.queue.enqueue(&job_id).await {
            // Do not leak a phantom queued job: the receipt must be accurate.
            error!(job_id = %job_id, error = %enqueue_err, "enqueue failed, failing job");
            let update = JobUpdate {
                status: Some(JobStatus::Failed),
                error: Some(JobError::new(
                    JobErrorKind::EnqueueFailed,
                    format!("failed to enqueue job: {enqueue_err}"),
                )),
                finished_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(update_err) = self.store.update_job(&job_id, update).await {
                error!(job_id = %job_id, error = %update_err, "failed to record enqueue failure");
            }
            metrics::increment(self.store.as_ref(), "jobs_total", &[("status", "failed")]).await;
            record.status = JobStatus::Failed;
            return Ok(SubmissionReceipt::for_job(&record));
        }

        metrics::increment(self.store.as_ref(), "jobs_created_total", &[]).await;
        metrics::increment(self.store.as_ref(), "jobs_total", &[("status", "queued")]).await;

        Ok(SubmissionReceipt::for_job(&record))
    }
}

/// Content fingerprint for requests without an explicit idempotency key:
/// sha-256 over the canonical JSON of the parameters, the owner token and a
/// version marker, truncated to 16 hex characters. `serde_json` maps are
/// sorted, which makes the serialization canonical.
fn fingerprint(params: &SubmissionParams, owner: &str) -> String {
    let canonical = serde_json::json!({
        "prompt": params.prompt,
        "negative_prompt": params.negative_prompt,
        "width": params.width,
        "height": params.height,
        "steps": params.steps,
        "cfg_scale": params.cfg_scale,
        "sampler": params.sampler,
        "seed": params.seed,
        "model": params.model,
        "batch_size": params.batch_size,
        "token": owner,
        "version": "v1",
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id::is_valid_job_id;
    use crate::kernel::jobs::testing::{MemoryJobQueue, MemoryJobStore};
    use std::sync::atomic::Ordering;

    fn params(prompt: &str) -> SubmissionParams {
        serde_json::from_value(serde_json::json!({ "prompt": prompt })).unwrap()
    }

    fn service(
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryJobQueue>,
    ) -> SubmissionService {
        SubmissionService::new(store, queue, "test-model.safetensors", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn submit_creates_a_queued_job_and_enqueues_it() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        let receipt = svc.submit(params("a cat"), "tok", None).await.unwrap();

        assert!(is_valid_job_id(&receipt.job_id));
        assert_eq!(receipt.status, JobStatus::Queued);
        assert_eq!(receipt.location, format!("/api/v1/jobs/{}", receipt.job_id));

        let job = store.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.params.model.as_deref(), Some("test-model.safetensors"));
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn double_submit_with_explicit_key_returns_same_job() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        let first = svc
            .submit(params("a cat"), "tok", Some("key-A".into()))
            .await
            .unwrap();
        let second = svc
            .submit(params("a cat"), "tok", Some("key-A".into()))
            .await
            .unwrap();

        assert_eq!(first.job_id, second.job_id);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn identical_bodies_deduplicate_via_fingerprint() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        let first = svc.submit(params("a cat"), "tok", None).await.unwrap();
        let second = svc.submit(params("a cat"), "tok", None).await.unwrap();
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn different_bodies_do_not_deduplicate() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        let first = svc.submit(params("a cat"), "tok", None).await.unwrap();
        let second = svc.submit(params("a dog"), "tok", None).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn different_owners_do_not_deduplicate() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        let first = svc.submit(params("a cat"), "alice", None).await.unwrap();
        let second = svc.submit(params("a cat"), "bob", None).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn concurrent_submissions_converge_on_one_job() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = Arc::new(service(store.clone(), queue.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.submit(params("a cat"), "tok", Some("key-B".into()))
                    .await
                    .unwrap()
                    .job_id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "all submissions must share one job id");
    }

    #[tokio::test]
    async fn dangling_idempotency_binding_self_heals() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        // Binding exists, record does not.
        store
            .set_idempotency("tok", "key-C", "j_danglingxxxx", Duration::from_secs(60))
            .await
            .unwrap();

        let receipt = svc
            .submit(params("a cat"), "tok", Some("key-C".into()))
            .await
            .unwrap();

        assert_eq!(receipt.job_id, "j_danglingxxxx");
        assert!(store.get_job("j_danglingxxxx").await.unwrap().is_some());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_failure_fails_the_job_but_returns_a_receipt() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        queue.fail_enqueue.store(true, Ordering::SeqCst);
        let svc = service(store.clone(), queue.clone());

        let receipt = svc.submit(params("a cat"), "tok", None).await.unwrap();
        assert_eq!(receipt.status, JobStatus::Failed);

        let job = store.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::EnqueueFailed);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn invalid_params_are_rejected_before_any_write() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let svc = service(store.clone(), queue.clone());

        let mut bad = params("a cat");
        bad.width = 500; // not a multiple of 8
        let result = svc.submit(bad, "tok", None).await;
        assert!(matches!(result, Err(ApiError::Validation { .. })));
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[test]
    fn fingerprint_is_stable_and_owner_sensitive() {
        let a = fingerprint(&params("a cat"), "tok");
        let b = fingerprint(&params("a cat"), "tok");
        let c = fingerprint(&params("a cat"), "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
