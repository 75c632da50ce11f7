//! In-memory implementations of the kernel seams for tests.
//!
//! These mirror the production semantics that matter to callers: the
//! transition compare-and-set, monotonic progress, create-if-absent
//! idempotency, queue leases with visibility timeouts, and artifact keys.
//! No external services are required anywhere in the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::kernel::engine::{
    EngineClient, EngineError, GeneratedImages, ProgressSink,
};
use crate::kernel::queue::{JobQueue, LeasedJob, QueueError};
use crate::kernel::storage::{ArtifactStore, StorageError};
use crate::kernel::store::{JobStore, JobUpdate, StoreError};

use super::job::{JobRecord, JobStatus, SubmissionParams};

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// State store
// ============================================================================

#[derive(Default)]
struct MemoryStoreInner {
    jobs: HashMap<String, JobRecord>,
    job_expiries: HashMap<String, DateTime<Utc>>,
    idempotency: HashMap<(String, String), (String, DateTime<Utc>)>,
    cancel_flags: HashMap<String, DateTime<Utc>>,
    in_progress: BTreeSet<String>,
    metrics: BTreeMap<String, i64>,
}

/// In-memory state store sharing the production transition table.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric_value(&self, key: &str) -> i64 {
        lock(&self.inner).metrics.get(key).copied().unwrap_or(0)
    }

    /// Force a record's expiry into the past (for sweep tests).
    pub fn expire_job(&self, job_id: &str) {
        lock(&self.inner)
            .job_expiries
            .insert(job_id.to_string(), Utc::now() - chrono::Duration::seconds(1));
    }
}

fn record_ttl() -> chrono::Duration {
    chrono::Duration::hours(24)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if inner.jobs.contains_key(&record.job_id) {
            return Err(StoreError::Fatal(anyhow::anyhow!(
                "job {} already present",
                record.job_id
            )));
        }
        inner
            .job_expiries
            .insert(record.job_id.clone(), Utc::now() + record_ttl());
        inner.jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(lock(&self.inner).jobs.get(job_id).cloned())
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool, StoreError> {
        let mut inner = lock(&self.inner);
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if !update.allowed_sources().contains(&job.status) {
            return Ok(false);
        }

        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(progress) = update.progress {
            job.progress = job.progress.max(progress);
        }
        if let Some(message) = update.progress_message {
            job.progress_message = Some(message);
        }
        if let Some(started_at) = update.started_at {
            job.started_at.get_or_insert(started_at);
        }
        if let Some(finished_at) = update.finished_at {
            job.finished_at.get_or_insert(finished_at);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        if let Some(prompt_id) = update.engine_prompt_id {
            job.engine_prompt_id = Some(prompt_id);
        }

        inner
            .job_expiries
            .insert(job_id.to_string(), Utc::now() + record_ttl());
        Ok(true)
    }

    async fn set_idempotency(
        &self,
        owner: &str,
        key: &str,
        job_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = lock(&self.inner);
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let slot = (owner.to_string(), key.to_string());
        match inner.idempotency.get(&slot) {
            Some((_, existing_expiry)) if *existing_expiry > Utc::now() => Ok(false),
            _ => {
                inner
                    .idempotency
                    .insert(slot, (job_id.to_string(), expires));
                Ok(true)
            }
        }
    }

    async fn get_idempotency(&self, owner: &str, key: &str) -> Result<Option<String>, StoreError> {
        let inner = lock(&self.inner);
        Ok(inner
            .idempotency
            .get(&(owner.to_string(), key.to_string()))
            .filter(|(_, expires)| *expires > Utc::now())
            .map(|(job_id, _)| job_id.clone()))
    }

    async fn set_cancel_flag(&self, job_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        lock(&self.inner)
            .cancel_flags
            .insert(job_id.to_string(), expires);
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.inner)
            .cancel_flags
            .get(job_id)
            .is_some_and(|expires| *expires > Utc::now()))
    }

    async fn clear_cancel_flag(&self, job_id: &str) -> Result<(), StoreError> {
        lock(&self.inner).cancel_flags.remove(job_id);
        Ok(())
    }

    async fn mark_in_progress(&self, job_id: &str) -> Result<(), StoreError> {
        lock(&self.inner).in_progress.insert(job_id.to_string());
        Ok(())
    }

    async fn unmark_in_progress(&self, job_id: &str) -> Result<(), StoreError> {
        lock(&self.inner).in_progress.remove(job_id);
        Ok(())
    }

    async fn list_in_progress(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.inner).in_progress.iter().cloned().collect())
    }

    async fn increment_metric(&self, key: &str) -> Result<(), StoreError> {
        *lock(&self.inner).metrics.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn list_metrics(&self) -> Result<Vec<(String, i64)>, StoreError> {
        Ok(lock(&self.inner)
            .metrics
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = lock(&self.inner);
        let mut expired = 0u64;
        let overdue: Vec<String> = inner
            .job_expiries
            .iter()
            .filter(|(_, expires)| **expires < now)
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in overdue {
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                inner.job_expiries.remove(&job_id);
                continue;
            };
            if job.status.is_terminal() {
                inner.jobs.remove(&job_id);
                inner.job_expiries.remove(&job_id);
            } else {
                job.status = JobStatus::Expired;
                job.finished_at.get_or_insert(now);
                inner.job_expiries.insert(job_id, now + record_ttl());
                expired += 1;
            }
        }

        inner.cancel_flags.retain(|_, expires| *expires >= now);
        inner.idempotency.retain(|_, (_, expires)| *expires >= now);
        Ok(expired)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct MemoryQueueInner {
    next_id: i64,
    ready: VecDeque<(i64, String)>,
    leased: HashMap<i64, (String, DateTime<Utc>)>,
}

/// In-memory queue with lease-based visibility, mirroring the durable one.
pub struct MemoryJobQueue {
    inner: Mutex<MemoryQueueInner>,
    visibility: chrono::Duration,
    pub fail_enqueue: AtomicBool,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_visibility(Duration::from_secs(1800))
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoryQueueInner::default()),
            visibility: chrono::Duration::from_std(visibility)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            fail_enqueue: AtomicBool::new(false),
        }
    }

    fn reclaim_expired(inner: &mut MemoryQueueInner) -> u64 {
        let now = Utc::now();
        let expired: Vec<i64> = inner
            .leased
            .iter()
            .filter(|(_, (_, until))| *until < now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some((job_id, _)) = inner.leased.remove(id) {
                inner.ready.push_back((*id, job_id));
            }
        }
        expired.len() as u64
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable(anyhow::anyhow!(
                "enqueue disabled by test"
            )));
        }
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.ready.push_back((id, job_id.to_string()));
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = lock(&self.inner);
                Self::reclaim_expired(&mut inner);
                if let Some((lease_id, job_id)) = inner.ready.pop_front() {
                    inner
                        .leased
                        .insert(lease_id, (job_id.clone(), Utc::now() + self.visibility));
                    return Ok(Some(LeasedJob { job_id, lease_id }));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ack(&self, lease: &LeasedJob) -> Result<(), QueueError> {
        lock(&self.inner).leased.remove(&lease.lease_id);
        Ok(())
    }

    async fn nack(&self, lease: &LeasedJob, requeue: bool) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        if let Some((job_id, _)) = inner.leased.remove(&lease.lease_id) {
            if requeue {
                let id = lease.lease_id;
                inner.ready.push_back((id, job_id));
            }
        }
        Ok(())
    }

    async fn reap(&self) -> Result<u64, QueueError> {
        let mut inner = lock(&self.inner);
        Ok(Self::reclaim_expired(&mut inner))
    }

    async fn depth(&self) -> Result<i64, QueueError> {
        Ok(lock(&self.inner).ready.len() as i64)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone)]
pub enum MockEngineBehavior {
    /// Report `steps` progress callbacks, then return one image per batch
    /// entry.
    Succeed {
        steps: usize,
        step_delay: Duration,
    },
    /// Engine accepted the workflow but execution failed.
    ExecutionError(String),
    /// Engine unreachable.
    Unavailable(String),
}

pub struct MockEngine {
    behavior: MockEngineBehavior,
    pub calls: AtomicUsize,
    pub healthy: AtomicBool,
}

impl MockEngine {
    pub fn new(behavior: MockEngineBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(MockEngineBehavior::Succeed {
            steps: 4,
            step_delay: Duration::from_millis(5),
        })
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn generate(
        &self,
        params: &SubmissionParams,
        sink: &dyn ProgressSink,
    ) -> Result<GeneratedImages, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        match &self.behavior {
            MockEngineBehavior::Unavailable(message) => {
                Err(EngineError::Unavailable(message.clone()))
            }
            MockEngineBehavior::ExecutionError(message) => {
                sink.report(0.05, "submitting workflow").await?;
                Err(EngineError::Execution(message.clone()))
            }
            MockEngineBehavior::Succeed { steps, step_delay } => {
                for step in 0..*steps {
                    let fraction = 0.05 + 0.85 * (step as f64 / *steps as f64);
                    sink.report(fraction, &format!("step {}/{}", step + 1, steps))
                        .await?;
                    tokio::time::sleep(*step_delay).await;
                }

                let seed = match params.seed {
                    Some(seed) if seed >= 0 => seed,
                    _ => 42,
                };
                let artifacts = (0..params.batch_size as usize)
                    .map(|index| Bytes::from(format!("png-bytes-{index}")))
                    .collect();

                Ok(GeneratedImages {
                    artifacts,
                    seed,
                    engine_prompt_id: format!("prompt-{call}"),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Artifact store
// ============================================================================

#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<BTreeMap<String, (Bytes, String)>>,
    fail_keys: Mutex<BTreeSet<String>>,
    fail_all: AtomicBool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn object_keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn fail_key(&self, key: &str) {
        lock(&self.fail_keys).insert(key.to_string());
    }

    pub fn fail_all_puts(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if self.fail_all.load(Ordering::SeqCst) || lock(&self.fail_keys).contains(key) {
            return Err(StorageError(format!("simulated upload failure for {key}")));
        }
        lock(&self.objects).insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let body = serde_json::to_vec(value).map_err(|e| StorageError(e.to_string()))?;
        self.put_bytes(key, Bytes::from(body), "application/json")
            .await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if self.fail_all.load(Ordering::SeqCst) || lock(&self.fail_keys).contains(key) {
            return Err(StorageError(format!("simulated presign failure for {key}")));
        }
        Ok(format!(
            "https://storage.local/render-artifacts/{key}?expires={}&sig=test",
            ttl.as_secs()
        ))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::JobRecord;

    fn record(job_id: &str) -> JobRecord {
        let params: SubmissionParams =
            serde_json::from_value(serde_json::json!({ "prompt": "a cat" })).unwrap();
        JobRecord::queued(job_id.to_string(), "tok".into(), "key".into(), params)
    }

    #[tokio::test]
    async fn create_job_rejects_duplicate_ids() {
        let store = MemoryJobStore::new();
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        assert!(store.create_job(&record("j_abcdefghijkl")).await.is_err());
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let store = MemoryJobStore::new();
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();
        assert!(store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Succeeded))
            .await
            .unwrap());

        // Second terminal write loses the compare-and-set.
        assert!(!store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Failed))
            .await
            .unwrap());
        // And so do plain field updates.
        let progress_only = JobUpdate {
            progress: Some(0.5),
            ..Default::default()
        };
        assert!(!store
            .update_job("j_abcdefghijkl", progress_only)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let store = MemoryJobStore::new();
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        store
            .update_job("j_abcdefghijkl", JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();

        for progress in [0.4, 0.2] {
            let update = JobUpdate {
                progress: Some(progress),
                ..Default::default()
            };
            store.update_job("j_abcdefghijkl", update).await.unwrap();
        }
        let job = store.get_job("j_abcdefghijkl").await.unwrap().unwrap();
        assert_eq!(job.progress, 0.4);
    }

    #[tokio::test]
    async fn idempotency_is_create_if_absent() {
        let store = MemoryJobStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_idempotency("tok", "k", "j_1", ttl).await.unwrap());
        assert!(!store.set_idempotency("tok", "k", "j_2", ttl).await.unwrap());
        assert_eq!(
            store.get_idempotency("tok", "k").await.unwrap().as_deref(),
            Some("j_1")
        );
    }

    #[tokio::test]
    async fn sweep_marks_overdue_records_expired() {
        let store = MemoryJobStore::new();
        store.create_job(&record("j_abcdefghijkl")).await.unwrap();
        store.expire_job("j_abcdefghijkl");

        let expired = store.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(expired, 1);
        let job = store.get_job("j_abcdefghijkl").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Expired);
    }

    #[tokio::test]
    async fn queue_redelivers_after_visibility_timeout() {
        let queue = MemoryJobQueue::with_visibility(Duration::from_millis(20));
        queue.enqueue("j_abcdefghijkl").await.unwrap();

        let first = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        // Not acked; lease expires.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn acked_items_are_never_redelivered() {
        let queue = MemoryJobQueue::with_visibility(Duration::from_millis(10));
        queue.enqueue("j_abcdefghijkl").await.unwrap();
        let lease = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        queue.ack(&lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.dequeue(Duration::from_millis(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = MemoryJobQueue::new();
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(30)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
