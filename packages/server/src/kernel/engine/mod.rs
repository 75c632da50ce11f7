//! Engine adapter.
//!
//! The image engine is a remote service with a submit/poll/fetch-bytes
//! contract: workflows go in via `POST /prompt`, completion is observed by
//! polling `GET /history/{prompt_id}`, and output bytes come back through
//! `GET /view`. The adapter owns the workflow template and synthesizes
//! progress callbacks from polling.

mod workflow;

pub use workflow::WorkflowTemplate;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::jobs::SubmissionParams;

/// Backoff between submit attempts.
const SUBMIT_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
const SUBMIT_ATTEMPTS: usize = 3;

/// Consecutive poll failures tolerated before the engine counts as gone.
const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Unavailable(String),
    #[error("engine rejected workflow: {0}")]
    InvalidWorkflow(String),
    #[error("engine execution failed: {0}")]
    Execution(String),
    #[error("malformed engine response: {0}")]
    Malformed(String),
    #[error("engine did not finish within {0} seconds")]
    Timeout(u64),
    #[error("generation canceled")]
    Canceled,
    /// Caller-side abort (progress reporting failed); the job must not be
    /// finalized from this state.
    #[error("generation aborted: {0}")]
    Aborted(String),
}

/// Why a progress sink refused an update.
#[derive(Debug, Error)]
pub enum SinkAbort {
    #[error("cancel requested")]
    Canceled,
    #[error("{0}")]
    Failed(String),
}

impl From<SinkAbort> for EngineError {
    fn from(abort: SinkAbort) -> Self {
        match abort {
            SinkAbort::Canceled => EngineError::Canceled,
            SinkAbort::Failed(message) => EngineError::Aborted(message),
        }
    }
}

/// Receives progress callbacks during generation. Returning an error stops
/// the adapter; `SinkAbort::Canceled` is the cooperative cancel signal.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, fraction: f64, message: &str) -> Result<(), SinkAbort>;
}

/// Output of one engine run.
#[derive(Debug)]
pub struct GeneratedImages {
    pub artifacts: Vec<Bytes>,
    pub seed: i64,
    pub engine_prompt_id: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Run one generation to completion, reporting progress at least every
    /// couple of seconds while the engine works.
    async fn generate(
        &self,
        params: &SubmissionParams,
        sink: &dyn ProgressSink,
    ) -> Result<GeneratedImages, EngineError>;

    async fn health_check(&self) -> bool;
}

// ============================================================================
// HTTP client
// ============================================================================

/// Engine client speaking the ComfyUI HTTP protocol.
pub struct ComfyClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    timeout: Duration,
    poll_interval: Duration,
    workflow: WorkflowTemplate,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    prompt: &'a Value,
    client_id: &'a str,
}

#[derive(Deserialize)]
struct PromptResponse {
    prompt_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct HistoryEntry {
    #[serde(default)]
    status: HistoryStatus,
    #[serde(default)]
    outputs: HashMap<String, NodeOutput>,
}

#[derive(Deserialize, Default)]
struct HistoryStatus {
    #[serde(default)]
    completed: bool,
    status_str: Option<String>,
    #[serde(default)]
    messages: Value,
}

#[derive(Deserialize, Default)]
struct NodeOutput {
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(Deserialize)]
struct ImageRef {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl HistoryEntry {
    /// Error message when the engine reported a failed execution.
    fn error_message(&self) -> Option<String> {
        if self.status.status_str.as_deref() != Some("error") {
            return None;
        }
        // messages is a list of [kind, payload] pairs
        if let Some(entries) = self.status.messages.as_array() {
            for entry in entries {
                if entry.get(0).and_then(Value::as_str) == Some("execution_error") {
                    if let Some(message) = entry
                        .get(1)
                        .and_then(|payload| payload.get("exception_message"))
                        .and_then(Value::as_str)
                    {
                        return Some(message.to_string());
                    }
                }
            }
        }
        Some("engine reported an execution error".to_string())
    }

    fn is_completed(&self) -> bool {
        self.status.completed || self.status.status_str.as_deref() == Some("success")
    }

    fn image_refs(&self) -> Vec<&ImageRef> {
        let mut refs: Vec<(&String, &ImageRef)> = self
            .outputs
            .iter()
            .flat_map(|(node, output)| output.images.iter().map(move |image| (node, image)))
            .collect();
        // Stable order across polls: outputs is a map
        refs.sort_by(|a, b| (a.0, &a.1.filename).cmp(&(b.0, &b.1.filename)));
        refs.into_iter().map(|(_, image)| image).collect()
    }
}

impl ComfyClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
        workflow: WorkflowTemplate,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            timeout,
            poll_interval,
            workflow,
        })
    }

    /// Submit a workflow, retrying transient failures with backoff.
    async fn submit(&self, workflow: &Value) -> Result<String, EngineError> {
        let url = format!("{}/prompt", self.base_url);
        let body = PromptRequest {
            prompt: workflow,
            client_id: &self.client_id,
        };

        let mut last_error = String::new();
        for attempt in 0..SUBMIT_ATTEMPTS {
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_client_error() => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(EngineError::InvalidWorkflow(text));
                }
                Ok(response) if response.status().is_success() => {
                    let parsed: PromptResponse = response
                        .json()
                        .await
                        .map_err(|e| EngineError::Malformed(e.to_string()))?;
                    return parsed
                        .prompt_id
                        .ok_or_else(|| EngineError::Malformed("no prompt_id in response".into()));
                }
                Ok(response) => {
                    last_error = format!("engine returned {}", response.status());
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }

            if let Some(backoff) = SUBMIT_BACKOFF.get(attempt) {
                debug!(attempt, error = %last_error, "retrying workflow submission");
                tokio::time::sleep(*backoff).await;
            }
        }

        Err(EngineError::Unavailable(last_error))
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, String> {
        let url = format!("{}/history/{}", self.base_url, prompt_id);
        let response = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("history returned {}", response.status()));
        }
        let mut entries: HashMap<String, HistoryEntry> =
            response.json().await.map_err(|e| e.to_string())?;
        Ok(entries.remove(prompt_id))
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Bytes, EngineError> {
        let url = format!("{}/view", self.base_url);
        let mut query: Vec<(&str, &str)> = vec![
            ("filename", image.filename.as_str()),
            ("type", image.folder_type.as_str()),
        ];
        if !image.subfolder.is_empty() {
            query.push(("subfolder", image.subfolder.as_str()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Malformed(format!(
                "artifact fetch for {} returned {}",
                image.filename,
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))
    }
}

/// Progress fraction synthesized from elapsed wall time: ramps from 0.1
/// toward 0.9, halfway after 30 seconds.
fn synthetic_progress(elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    0.1 + 0.8 * (secs / (secs + 30.0))
}

#[async_trait]
impl EngineClient for ComfyClient {
    async fn generate(
        &self,
        params: &SubmissionParams,
        sink: &dyn ProgressSink,
    ) -> Result<GeneratedImages, EngineError> {
        let seed = match params.seed {
            Some(seed) if seed >= 0 => seed,
            _ => rand::random::<u32>() as i64,
        };
        let prefix = format!("render_{}", &self.client_id[..8]);
        let workflow = self.workflow.render(params, seed, &prefix);

        sink.report(0.05, "submitting workflow").await?;
        let started = Instant::now();
        let prompt_id = self.submit(&workflow).await?;
        info!(prompt_id = %prompt_id, "workflow submitted");

        let mut poll_failures = 0u32;
        let entry = loop {
            if started.elapsed() > self.timeout {
                return Err(EngineError::Timeout(self.timeout.as_secs()));
            }

            sink.report(synthetic_progress(started.elapsed()), "generating")
                .await?;

            match self.fetch_history(&prompt_id).await {
                Ok(Some(entry)) => {
                    if let Some(message) = entry.error_message() {
                        return Err(EngineError::Execution(message));
                    }
                    if entry.is_completed() {
                        break entry;
                    }
                    poll_failures = 0;
                }
                Ok(None) => {
                    // Not in history yet: still queued or executing
                    poll_failures = 0;
                }
                Err(error) => {
                    poll_failures += 1;
                    warn!(prompt_id = %prompt_id, %error, poll_failures, "history poll failed");
                    if poll_failures >= MAX_POLL_FAILURES {
                        return Err(EngineError::Unavailable(error));
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        };

        sink.report(0.9, "fetching artifacts").await?;

        let refs = entry.image_refs();
        if refs.is_empty() {
            return Err(EngineError::Malformed(
                "history contained no output images".into(),
            ));
        }

        let mut artifacts = Vec::with_capacity(refs.len());
        for image in refs {
            artifacts.push(self.fetch_image(image).await?);
        }

        Ok(GeneratedImages {
            artifacts,
            seed,
            engine_prompt_id: prompt_id,
            elapsed: started.elapsed(),
        })
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/system_stats", self.base_url);
        let probe = self.http.get(&url).send();
        match tokio::time::timeout(Duration::from_secs(5), probe).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn synthetic_progress_is_monotonic_and_bounded() {
        let mut last = 0.0;
        for secs in [0u64, 1, 5, 30, 120, 1200] {
            let value = synthetic_progress(Duration::from_secs(secs));
            assert!(value >= last);
            assert!(value < 0.9);
            last = value;
        }
        assert!(synthetic_progress(Duration::ZERO) >= 0.1);
    }

    #[test]
    fn history_entry_detects_completion() {
        let entry: HistoryEntry = serde_json::from_value(json!({
            "status": {"completed": true, "status_str": "success", "messages": []},
            "outputs": {}
        }))
        .unwrap();
        assert!(entry.is_completed());
        assert!(entry.error_message().is_none());
    }

    #[test]
    fn history_entry_extracts_execution_error() {
        let entry: HistoryEntry = serde_json::from_value(json!({
            "status": {
                "completed": false,
                "status_str": "error",
                "messages": [
                    ["execution_start", {}],
                    ["execution_error", {"exception_message": "model not found"}]
                ]
            }
        }))
        .unwrap();
        assert_eq!(entry.error_message().as_deref(), Some("model not found"));
    }

    #[test]
    fn history_entry_error_without_message_gets_default() {
        let entry: HistoryEntry = serde_json::from_value(json!({
            "status": {"status_str": "error", "messages": []}
        }))
        .unwrap();
        assert!(entry.error_message().is_some());
    }

    #[test]
    fn image_refs_are_ordered_and_flattened() {
        let entry: HistoryEntry = serde_json::from_value(json!({
            "status": {"completed": true},
            "outputs": {
                "9": {"images": [
                    {"filename": "b.png", "subfolder": "", "type": "output"},
                    {"filename": "a.png", "subfolder": "", "type": "output"}
                ]}
            }
        }))
        .unwrap();
        let refs = entry.image_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].filename, "a.png");
    }

    #[test]
    fn sink_abort_maps_to_engine_errors() {
        assert!(matches!(
            EngineError::from(SinkAbort::Canceled),
            EngineError::Canceled
        ));
        assert!(matches!(
            EngineError::from(SinkAbort::Failed("store down".into())),
            EngineError::Aborted(_)
        ));
    }
}
