//! Per-job progress pub/sub.
//!
//! Workers publish `ProgressEvent` frames on a per-job topic; the streaming
//! endpoint forwards them to subscribed clients. Messages are not persisted:
//! a subscriber attaching mid-run sees the current snapshot plus subsequent
//! events only.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use super::jobs::{JobError, JobResult, JobStatus};

/// One frame on a job's progress topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Sent once at stream open with the current snapshot.
    Status { status: JobStatus, progress: f64 },
    Progress {
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Emitted as each artifact upload completes.
    Artifact { url: String },
    Log { message: String },
    /// Final frame; the stream closes after forwarding it.
    Done {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<JobResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<JobError>,
    },
}

impl ProgressEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, ProgressEvent::Done { .. })
    }

    /// Frame name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Artifact { .. } => "artifact",
            ProgressEvent::Log { .. } => "log",
            ProgressEvent::Done { .. } => "done",
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Publish/subscribe seam between workers and the streaming endpoint.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, job_id: &str, event: &ProgressEvent) -> Result<()>;
    async fn subscribe(&self, job_id: &str) -> Result<EventStream>;
}

// ============================================================================
// NATS-backed bus (cross-process)
// ============================================================================

/// Event bus over NATS subjects, one subject per job.
pub struct NatsEventBus {
    client: async_nats::Client,
    namespace: String,
}

impl NatsEventBus {
    pub fn new(client: async_nats::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn subject(&self, job_id: &str) -> String {
        format!("{}.ws.jobs.{}", self.namespace, job_id)
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, job_id: &str, event: &ProgressEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(self.subject(job_id), payload.into())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, job_id: &str) -> Result<EventStream> {
        let subscriber = self.client.subscribe(self.subject(job_id)).await?;
        let stream = subscriber.filter_map(|message| async move {
            match serde_json::from_slice::<ProgressEvent>(&message.payload) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping undecodable progress frame");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// In-process bus (single-process deployments and tests)
// ============================================================================

/// Topic-keyed broadcast channels. Publishing to a topic with no
/// subscribers is a no-op, matching the not-persisted contract.
#[derive(Clone)]
pub struct LocalEventBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>>,
    capacity: usize,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, job_id: &str, event: &ProgressEvent) -> Result<()> {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(job_id) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(event.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, job_id: &str) -> Result<EventStream> {
        let rx = {
            let mut channels = self.channels.write().await;
            channels
                .entry(job_id.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        let stream = BroadcastStream::new(rx).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(_lagged) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_a_type_discriminant() {
        let frame = ProgressEvent::Progress {
            progress: 0.42,
            message: Some("denoising".to_string()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["progress"], 0.42);
    }

    #[test]
    fn done_frame_roundtrips() {
        let frame = ProgressEvent::Done {
            status: JobStatus::Succeeded,
            result: None,
            error: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_done());
    }

    #[test]
    fn status_frame_serializes_status_as_snake_case() {
        let frame = ProgressEvent::Status {
            status: JobStatus::Running,
            progress: 0.0,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["status"], "running");
    }

    #[tokio::test]
    async fn local_bus_delivers_to_subscribers() {
        let bus = LocalEventBus::new();
        let mut stream = bus.subscribe("j_a").await.unwrap();

        let event = ProgressEvent::Log {
            message: "hello".to_string(),
        };
        bus.publish("j_a", &event).await.unwrap();

        assert_eq!(stream.next().await, Some(event));
    }

    #[tokio::test]
    async fn local_bus_publish_without_subscribers_is_noop() {
        let bus = LocalEventBus::new();
        bus.publish(
            "j_nobody",
            &ProgressEvent::Log {
                message: "dropped".to_string(),
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn local_bus_is_isolated_per_topic() {
        let bus = LocalEventBus::new();
        let mut a = bus.subscribe("j_a").await.unwrap();
        let _b = bus.subscribe("j_b").await.unwrap();

        bus.publish(
            "j_a",
            &ProgressEvent::Log {
                message: "for a".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(a.next().await.is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_empty_channels() {
        let bus = LocalEventBus::new();
        let stream = bus.subscribe("j_ephemeral").await.unwrap();
        assert_eq!(bus.channels.read().await.len(), 1);

        drop(stream);
        bus.cleanup().await;
        assert_eq!(bus.channels.read().await.len(), 0);
    }
}
