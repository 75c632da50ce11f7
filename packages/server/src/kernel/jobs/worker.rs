//! Worker runtime.
//!
//! A worker process hosts a bounded pool of concurrent task slots. Each
//! slot dequeues a job id, marks it in-progress, drives the engine with a
//! coalescing progress sink, uploads artifacts, writes the terminal state
//! under the transition compare-and-set and publishes the final event.
//!
//! Delivery is at-least-once: the terminal CAS is the single serialization
//! point, so duplicate deliveries and crash-recovered re-runs are dropped
//! when they lose the race.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kernel::engine::{
    EngineClient, EngineError, GeneratedImages, ProgressSink, SinkAbort,
};
use crate::kernel::events::{EventBus, ProgressEvent};
use crate::kernel::metrics;
use crate::kernel::queue::{JobQueue, LeasedJob};
use crate::kernel::storage::{artifact_key, metadata_key, ArtifactStore};
use crate::kernel::store::{JobStore, JobUpdate, StoreError};

use super::job::{JobArtifact, JobError, JobErrorKind, JobRecord, JobStatus};

/// What to do with jobs found in the in-progress set at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Put the job back on the queue; it may run again (at-least-once).
    Reenqueue,
    /// Finalize the job as failed with kind `WorkerCrashed`.
    FailFast,
}

impl FromStr for RecoveryPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "reenqueue" | "re-enqueue" => Ok(RecoveryPolicy::Reenqueue),
            "fail_fast" | "failfast" => Ok(RecoveryPolicy::FailFast),
            other => Err(anyhow::anyhow!("unknown recovery policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent task slots per worker process.
    pub concurrency: usize,
    /// Short dequeue poll so slots stay responsive to shutdown.
    pub dequeue_timeout: Duration,
    /// Progress publish coalescing window per job.
    pub publish_window: Duration,
    pub artifact_url_ttl: Duration,
    pub cancel_flag_ttl: Duration,
    pub reap_interval: Duration,
    pub sweep_interval: Duration,
    pub recovery: RecoveryPolicy,
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            dequeue_timeout: Duration::from_secs(5),
            publish_window: Duration::from_millis(200),
            artifact_url_ttl: Duration::from_secs(3600),
            cancel_flag_ttl: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            recovery: RecoveryPolicy::Reenqueue,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

enum RunOutcome {
    /// Terminal state written (or delivery dropped); safe to ack.
    Finished,
    /// Task aborted without a terminal write. The lease and in-progress
    /// marker are left in place so redelivery or recovery picks it up.
    Aborted,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    engine: Arc<dyn EngineClient>,
    artifacts: Arc<dyn ArtifactStore>,
    bus: Arc<dyn EventBus>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        engine: Arc<dyn EngineClient>,
        artifacts: Arc<dyn ArtifactStore>,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            artifacts,
            bus,
            config,
        }
    }

    /// Recovery sweep: resolve every job left in the in-progress set by a
    /// crashed worker, then clear the set.
    pub async fn recover(&self) -> Result<()> {
        let orphans = self.store.list_in_progress().await?;
        if orphans.is_empty() {
            return Ok(());
        }
        info!(
            count = orphans.len(),
            policy = ?self.config.recovery,
            "recovering orphaned in-progress jobs"
        );

        for job_id in orphans {
            let record = match self.store.get_job(&job_id).await {
                Ok(record) => record,
                Err(error) => {
                    error!(job_id = %job_id, %error, "failed to read orphaned job, leaving marker");
                    continue;
                }
            };

            match record {
                Some(job) if !job.status.is_terminal() => match self.config.recovery {
                    RecoveryPolicy::Reenqueue => {
                        if let Err(error) = self.queue.enqueue(&job_id).await {
                            error!(job_id = %job_id, %error, "failed to re-enqueue orphaned job");
                            continue;
                        }
                        info!(job_id = %job_id, "re-enqueued orphaned job");
                    }
                    RecoveryPolicy::FailFast => {
                        let job_error = JobError::new(
                            JobErrorKind::WorkerCrashed,
                            "worker crashed while processing this job",
                        );
                        self.finalize_failed(&job_id, job_error).await;
                    }
                },
                _ => {}
            }

            if let Err(error) = self.store.unmark_in_progress(&job_id).await {
                error!(job_id = %job_id, %error, "failed to unmark orphaned job");
            }
        }

        Ok(())
    }

    /// Run all slots plus the maintenance loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker pool starting"
        );

        let mut handles = Vec::with_capacity(self.config.concurrency + 1);
        for slot in 0..self.config.concurrency {
            let pool = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.slot_loop(slot, token).await;
            }));
        }
        {
            let pool = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.maintenance_loop(token).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        debug!(slot, "worker slot started");
        loop {
            let lease = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.queue.dequeue(self.config.dequeue_timeout) => match dequeued {
                    Ok(Some(lease)) => lease,
                    Ok(None) => continue,
                    Err(error) => {
                        error!(%error, "dequeue failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            self.process(lease).await;
        }
        debug!(slot, "worker slot stopped");
    }

    /// Periodic queue reap and record-TTL sweep.
    async fn maintenance_loop(&self, shutdown: CancellationToken) {
        let mut reap = tokio::time::interval(self.config.reap_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reap.tick() => {
                    if let Err(error) = self.queue.reap().await {
                        error!(%error, "queue reap failed");
                    }
                }
                _ = sweep.tick() => {
                    match self.store.sweep_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(expired) => info!(expired, "expired overdue job records"),
                        Err(error) => error!(%error, "record expiry sweep failed"),
                    }
                }
            }
        }
    }

    async fn process(&self, lease: LeasedJob) {
        let job_id = lease.job_id.clone();

        if let Err(error) = retried(|| self.store.mark_in_progress(&job_id)).await {
            error!(job_id = %job_id, %error, "failed to mark job in progress");
            let _ = self.queue.nack(&lease, true).await;
            return;
        }

        match self.run_job(&job_id).await {
            RunOutcome::Finished => {
                if let Err(error) = retried(|| self.store.unmark_in_progress(&job_id)).await {
                    error!(job_id = %job_id, %error, "failed to unmark job");
                }
                if let Err(error) = self.queue.ack(&lease).await {
                    error!(job_id = %job_id, %error, "failed to ack job");
                }
            }
            RunOutcome::Aborted => {
                // No terminal write happened. Keep the in-progress marker and
                // the lease: redelivery or the recovery sweep will resume it.
                warn!(job_id = %job_id, "task aborted without a terminal write");
            }
        }
    }

    async fn run_job(&self, job_id: &str) -> RunOutcome {
        let job = match retried(|| self.store.get_job(job_id)).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "dequeued job has no record, dropping");
                return RunOutcome::Finished;
            }
            Err(error) => {
                error!(job_id = %job_id, %error, "failed to load job");
                return RunOutcome::Aborted;
            }
        };

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "job already terminal, dropping delivery");
            return RunOutcome::Finished;
        }

        // Cancel pre-check. A `canceling` record whose flag already expired
        // still converges to canceled here.
        let cancel_requested = job.status == JobStatus::Canceling
            || retried(|| self.store.is_cancel_requested(job_id))
                .await
                .unwrap_or_else(|error| {
                    warn!(job_id = %job_id, %error, "cancel flag check failed, assuming not set");
                    false
                });
        if cancel_requested {
            self.finalize_canceled(job_id).await;
            return RunOutcome::Finished;
        }

        let running = JobUpdate {
            status: Some(JobStatus::Running),
            started_at: Some(Utc::now()),
            progress: Some(0.0),
            ..Default::default()
        };
        match retried(|| self.store.update_job(job_id, running.clone())).await {
            Ok(true) => {
                self.publish(
                    job_id,
                    &ProgressEvent::Status {
                        status: JobStatus::Running,
                        progress: 0.0,
                    },
                )
                .await;
            }
            Ok(false) => {
                // Lost the transition; somebody moved the job under us.
                match self.store.get_job(job_id).await {
                    Ok(Some(current)) if current.status == JobStatus::Canceling => {
                        self.finalize_canceled(job_id).await;
                    }
                    Ok(Some(current)) => {
                        debug!(job_id = %job_id, status = %current.status, "dropping delivery after lost transition");
                    }
                    _ => {}
                }
                return RunOutcome::Finished;
            }
            Err(error) => {
                error!(job_id = %job_id, %error, "failed to transition job to running");
                return RunOutcome::Aborted;
            }
        }

        info!(job_id = %job_id, "job started");

        let sink = CoalescingSink {
            store: self.store.clone(),
            bus: self.bus.clone(),
            job_id: job_id.to_string(),
            window: self.config.publish_window,
            last_publish: Mutex::new(Instant::now() - self.config.publish_window),
        };

        match self.engine.generate(&job.params, &sink).await {
            Ok(images) => {
                self.finalize_success(job_id, &job, images).await;
                RunOutcome::Finished
            }
            Err(EngineError::Canceled) => {
                info!(job_id = %job_id, "job canceled during generation");
                self.finalize_canceled(job_id).await;
                RunOutcome::Finished
            }
            Err(EngineError::Aborted(message)) => {
                warn!(job_id = %job_id, %message, "generation aborted");
                RunOutcome::Aborted
            }
            Err(engine_error) => {
                warn!(job_id = %job_id, error = %engine_error, "generation failed");
                let kind = match engine_error {
                    EngineError::Unavailable(_) => JobErrorKind::EngineUnavailable,
                    _ => JobErrorKind::EngineError,
                };
                self.finalize_failed(job_id, JobError::new(kind, engine_error.to_string()))
                    .await;
                RunOutcome::Finished
            }
        }
    }

    async fn finalize_success(&self, job_id: &str, job: &JobRecord, images: GeneratedImages) {
        let total = images.artifacts.len();
        let mut artifacts: Vec<JobArtifact> = Vec::with_capacity(total);

        for (index, bytes) in images.artifacts.into_iter().enumerate() {
            let key = artifact_key(job_id, index);

            if let Err(error) = self.artifacts.put_bytes(&key, bytes, "image/png").await {
                error!(job_id = %job_id, key = %key, %error, "artifact upload failed");
                if artifacts.is_empty() {
                    self.finalize_failed(
                        job_id,
                        JobError::new(
                            JobErrorKind::StorageError,
                            format!("artifact upload failed: {error}"),
                        ),
                    )
                    .await;
                    return;
                }
                warn!(job_id = %job_id, uploaded = artifacts.len(), total, "continuing with partial artifacts");
                continue;
            }

            let url = match self
                .artifacts
                .presign_get(&key, self.config.artifact_url_ttl)
                .await
            {
                Ok(url) => url,
                Err(error) => {
                    error!(job_id = %job_id, key = %key, %error, "presign failed");
                    if artifacts.is_empty() {
                        self.finalize_failed(
                            job_id,
                            JobError::new(
                                JobErrorKind::StorageError,
                                format!("presign failed: {error}"),
                            ),
                        )
                        .await;
                        return;
                    }
                    continue;
                }
            };

            artifacts.push(JobArtifact {
                url: url.clone(),
                seed: images.seed,
                width: job.params.width,
                height: job.params.height,
                meta: Default::default(),
            });
            self.publish(job_id, &ProgressEvent::Artifact { url }).await;
        }

        if artifacts.is_empty() {
            self.finalize_failed(
                job_id,
                JobError::new(JobErrorKind::StorageError, "no artifacts were uploaded"),
            )
            .await;
            return;
        }

        // Metadata sidecar is best-effort; the artifacts already uploaded.
        let metadata = json!({
            "job_id": job_id,
            "params": job.params,
            "generated_at": Utc::now(),
            "artifacts": artifacts,
        });
        if let Err(error) = self.artifacts.put_json(&metadata_key(job_id), &metadata).await {
            warn!(job_id = %job_id, %error, "failed to write metadata sidecar");
        }

        let result = super::job::JobResult {
            artifacts,
            generation_time: images.elapsed.as_secs_f64(),
        };
        let update = JobUpdate {
            status: Some(JobStatus::Succeeded),
            progress: Some(1.0),
            result: Some(result.clone()),
            finished_at: Some(Utc::now()),
            engine_prompt_id: Some(images.engine_prompt_id),
            ..Default::default()
        };

        match retried(|| self.store.update_job(job_id, update.clone())).await {
            Ok(true) => {
                info!(job_id = %job_id, generation_time = result.generation_time, "job succeeded");
                self.publish(
                    job_id,
                    &ProgressEvent::Done {
                        status: JobStatus::Succeeded,
                        result: Some(result),
                        error: None,
                    },
                )
                .await;
                metrics::increment(
                    self.store.as_ref(),
                    "jobs_total",
                    &[("status", "succeeded")],
                )
                .await;
            }
            Ok(false) => {
                info!(job_id = %job_id, "terminal write lost the race, discarding result");
            }
            Err(error) => {
                error!(job_id = %job_id, %error, "failed to write terminal success");
            }
        }
    }

    async fn finalize_failed(&self, job_id: &str, job_error: JobError) {
        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            error: Some(job_error.clone()),
            finished_at: Some(Utc::now()),
            ..Default::default()
        };

        match retried(|| self.store.update_job(job_id, update.clone())).await {
            Ok(true) => {
                self.publish(
                    job_id,
                    &ProgressEvent::Done {
                        status: JobStatus::Failed,
                        result: None,
                        error: Some(job_error),
                    },
                )
                .await;
                metrics::increment(self.store.as_ref(), "jobs_total", &[("status", "failed")])
                    .await;
            }
            Ok(false) => {
                info!(job_id = %job_id, "terminal write lost the race, discarding failure");
            }
            Err(error) => {
                error!(job_id = %job_id, %error, "failed to write terminal failure");
            }
        }
    }

    async fn finalize_canceled(&self, job_id: &str) {
        let update = JobUpdate {
            status: Some(JobStatus::Canceled),
            finished_at: Some(Utc::now()),
            ..Default::default()
        };

        match retried(|| self.store.update_job(job_id, update.clone())).await {
            Ok(true) => {
                info!(job_id = %job_id, "job canceled");
                self.publish(
                    job_id,
                    &ProgressEvent::Done {
                        status: JobStatus::Canceled,
                        result: None,
                        error: None,
                    },
                )
                .await;
                metrics::increment(self.store.as_ref(), "jobs_total", &[("status", "canceled")])
                    .await;
            }
            Ok(false) => {
                debug!(job_id = %job_id, "cancel finalization lost the race");
            }
            Err(error) => {
                error!(job_id = %job_id, %error, "failed to finalize cancellation");
            }
        }

        if let Err(error) = self.store.clear_cancel_flag(job_id).await {
            warn!(job_id = %job_id, %error, "failed to clear cancel flag");
        }
    }

    async fn publish(&self, job_id: &str, event: &ProgressEvent) {
        if let Err(error) = self.bus.publish(job_id, event).await {
            warn!(job_id = %job_id, %error, "failed to publish event");
        }
    }
}

/// Progress sink bridging the engine adapter to the store and event bus,
/// coalescing publishes to at most one per window.
struct CoalescingSink {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus>,
    job_id: String,
    window: Duration,
    last_publish: Mutex<Instant>,
}

#[async_trait]
impl ProgressSink for CoalescingSink {
    async fn report(&self, fraction: f64, message: &str) -> Result<(), SinkAbort> {
        let canceled = retried(|| self.store.is_cancel_requested(&self.job_id))
            .await
            .map_err(|error| SinkAbort::Failed(error.to_string()))?;
        if canceled {
            return Err(SinkAbort::Canceled);
        }

        // Coalesce: drop intermediate values inside the window.
        {
            let mut last = self
                .last_publish
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.elapsed() < self.window {
                return Ok(());
            }
            *last = Instant::now();
        }

        let update = JobUpdate {
            progress: Some(fraction),
            progress_message: Some(message.to_string()),
            ..Default::default()
        };
        let updated = retried(|| self.store.update_job(&self.job_id, update.clone()))
            .await
            .map_err(|error| SinkAbort::Failed(error.to_string()))?;
        if !updated {
            // The record went terminal under us (a racing cancel or a
            // duplicate delivery that already finished). Stop generating and
            // publish nothing more on this topic.
            return Err(SinkAbort::Canceled);
        }

        let event = ProgressEvent::Progress {
            progress: fraction,
            message: (!message.is_empty()).then(|| message.to_string()),
        };
        if let Err(error) = self.bus.publish(&self.job_id, &event).await {
            warn!(job_id = %self.job_id, %error, "failed to publish progress");
        }

        Ok(())
    }
}

/// Retry a store operation once after a short backoff when the failure is
/// transient. Persistent failures bubble up and abort the task without a
/// terminal write.
async fn retried<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(StoreError::Retryable(first)) => {
            debug!(error = %first, "retrying transient store failure");
            tokio::time::sleep(Duration::from_millis(250)).await;
            op().await
        }
        other => other,
    }
}
