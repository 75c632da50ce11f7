//! Job record, status machine and submission parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::ApiError;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Canceling,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

impl JobStatus {
    /// Terminal states are final; the record becomes immutable once one is
    /// written.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Expired
        )
    }

    /// The set of statuses a record may be in for a transition to `target`
    /// to be accepted.
    ///
    /// This is the single transition table; both store implementations
    /// enforce it as a compare-and-set on every status write. `Running` is
    /// reachable from `Running` so a crash-recovered or duplicate delivery
    /// can re-run a job that never reached a terminal state.
    pub fn allowed_sources(target: JobStatus) -> &'static [JobStatus] {
        match target {
            JobStatus::Queued => &[],
            JobStatus::Running => &[JobStatus::Queued, JobStatus::Running],
            JobStatus::Canceling => &[JobStatus::Running],
            JobStatus::Succeeded => &[JobStatus::Running, JobStatus::Canceling],
            JobStatus::Failed => &[JobStatus::Queued, JobStatus::Running, JobStatus::Canceling],
            JobStatus::Canceled => &[JobStatus::Queued, JobStatus::Running, JobStatus::Canceling],
            JobStatus::Expired => &[JobStatus::Queued, JobStatus::Running, JobStatus::Canceling],
        }
    }

    /// Statuses a record can hold before any terminal write.
    pub fn non_terminal() -> &'static [JobStatus] {
        &[JobStatus::Queued, JobStatus::Running, JobStatus::Canceling]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Canceling => "canceling",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Submission parameters
// ============================================================================

/// Sampling algorithms a submission may name. The wire values are the
/// public fixed set; [`Sampler::engine_name`] translates to the engine's
/// internal sampler identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sampler {
    #[serde(rename = "euler")]
    Euler,
    #[default]
    #[serde(rename = "euler_ancestral", alias = "euler_a")]
    EulerAncestral,
    #[serde(rename = "heun")]
    Heun,
    #[serde(rename = "dpm_2")]
    Dpm2,
    #[serde(rename = "dpm_2_a")]
    Dpm2Ancestral,
    #[serde(rename = "dpm_plus_plus_2s_a")]
    Dpmpp2sAncestral,
    #[serde(rename = "dpm_plus_plus_2m")]
    Dpmpp2m,
    #[serde(rename = "dpm_plus_plus_sde")]
    DpmppSde,
    #[serde(rename = "dpm_fast")]
    DpmFast,
    #[serde(rename = "dpm_adaptive")]
    DpmAdaptive,
    #[serde(rename = "lms")]
    Lms,
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "uni_pc")]
    UniPc,
}

impl Sampler {
    /// The engine-side sampler name, injected into the workflow.
    pub fn engine_name(&self) -> &'static str {
        match self {
            Sampler::Euler => "euler",
            Sampler::EulerAncestral => "euler_ancestral",
            Sampler::Heun => "heun",
            Sampler::Dpm2 => "dpm_2",
            Sampler::Dpm2Ancestral => "dpm_2_ancestral",
            Sampler::Dpmpp2sAncestral => "dpmpp_2s_ancestral",
            Sampler::Dpmpp2m => "dpmpp_2m",
            Sampler::DpmppSde => "dpmpp_sde",
            Sampler::DpmFast => "dpm_fast",
            Sampler::DpmAdaptive => "dpm_adaptive",
            Sampler::Lms => "lms",
            Sampler::Ddim => "ddim",
            Sampler::UniPc => "uni_pc",
        }
    }
}

/// Immutable parameters of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default)]
    pub sampler: Sampler,
    /// -1 or absent means "choose randomly".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Engine-side checkpoint identifier; filled from config when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_dimension() -> u32 {
    512
}

fn default_steps() -> u32 {
    20
}

fn default_cfg_scale() -> f64 {
    7.0
}

fn default_batch_size() -> u32 {
    1
}

impl SubmissionParams {
    /// Validate against the submission constraints. Trims prompts; an empty
    /// negative prompt collapses to `None`.
    pub fn validate(&mut self) -> Result<(), ApiError> {
        self.prompt = self.prompt.trim().to_string();
        if self.prompt.is_empty() {
            return Err(ApiError::validation_with_field(
                "prompt must not be empty",
                "prompt",
            ));
        }
        if self.prompt.chars().count() > 5000 {
            return Err(ApiError::validation_with_field(
                "prompt must be at most 5000 characters",
                "prompt",
            ));
        }

        if let Some(negative) = &self.negative_prompt {
            let trimmed = negative.trim();
            if trimmed.chars().count() > 2000 {
                return Err(ApiError::validation_with_field(
                    "negative_prompt must be at most 2000 characters",
                    "negative_prompt",
                ));
            }
            self.negative_prompt = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }

        for (value, field) in [(self.width, "width"), (self.height, "height")] {
            if !(64..=2048).contains(&value) {
                return Err(ApiError::validation_with_field(
                    format!("{field} must be between 64 and 2048"),
                    field,
                ));
            }
            if value % 8 != 0 {
                return Err(ApiError::validation_with_field(
                    format!("{field} must be a multiple of 8, got {value}"),
                    field,
                ));
            }
        }

        if !(1..=150).contains(&self.steps) {
            return Err(ApiError::validation_with_field(
                "steps must be between 1 and 150",
                "steps",
            ));
        }
        if !(1.0..=30.0).contains(&self.cfg_scale) {
            return Err(ApiError::validation_with_field(
                "cfg_scale must be between 1.0 and 30.0",
                "cfg_scale",
            ));
        }
        if let Some(seed) = self.seed {
            if seed < -1 {
                return Err(ApiError::validation_with_field(
                    "seed must be -1 or a non-negative integer",
                    "seed",
                ));
            }
        }
        if !(1..=4).contains(&self.batch_size) {
            return Err(ApiError::validation_with_field(
                "batch_size must be between 1 and 4",
                "batch_size",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Results and errors
// ============================================================================

/// One generated artifact, addressed by a time-limited URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArtifact {
    pub url: String,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub meta: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub artifacts: Vec<JobArtifact>,
    /// Engine wall time in seconds.
    pub generation_time: f64,
}

/// Failure classification written by the worker or the recovery sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobErrorKind {
    EngineUnavailable,
    EngineError,
    StorageError,
    EnqueueFailed,
    WorkerCrashed,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Serialized as `type`; `type` is a keyword in Rust.
    #[serde(rename = "type")]
    pub kind: JobErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// The canonical, mutable state of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    /// Opaque submitter token; may be empty.
    pub owner: String,
    pub idempotency_key: String,
    pub params: SubmissionParams,
    pub status: JobStatus,
    pub progress: f64,
    pub progress_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    pub engine_prompt_id: Option<String>,
}

impl JobRecord {
    /// Build the initial record for a fresh submission.
    pub fn queued(
        job_id: String,
        owner: String,
        idempotency_key: String,
        params: SubmissionParams,
    ) -> Self {
        Self {
            job_id,
            owner,
            idempotency_key,
            params,
            status: JobStatus::Queued,
            progress: 0.0,
            progress_message: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            engine_prompt_id: None,
        }
    }

    /// Project into the public view. Owner-only fields are included when the
    /// requester's token matches the record's owner.
    pub fn view(&self, is_owner: bool) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            status: self.status,
            progress: self.progress,
            submitted_by: is_owner.then(|| self.owner.clone()),
            params: is_owner.then(|| self.params.clone()),
            result: self.result.clone(),
            error: self.error.clone(),
            timestamps: JobTimestamps {
                queued_at: self.queued_at,
                started_at: self.started_at,
                finished_at: self.finished_at,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Public projection of a job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<SubmissionParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub timestamps: JobTimestamps,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> SubmissionParams {
        SubmissionParams {
            prompt: "a cat".to_string(),
            negative_prompt: None,
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.0,
            sampler: Sampler::default(),
            seed: Some(42),
            model: Some("sd_xl_base_1.0.safetensors".to_string()),
            batch_size: 1,
        }
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Canceling.is_terminal());
    }

    #[test]
    fn no_transitions_out_of_terminal_states() {
        for target in [
            JobStatus::Running,
            JobStatus::Canceling,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Expired,
        ] {
            for source in JobStatus::allowed_sources(target) {
                assert!(
                    !source.is_terminal(),
                    "{source} -> {target} must not be allowed"
                );
            }
        }
    }

    #[test]
    fn canceling_converges_to_canceled_or_succeeded() {
        assert!(JobStatus::allowed_sources(JobStatus::Canceled).contains(&JobStatus::Canceling));
        assert!(JobStatus::allowed_sources(JobStatus::Succeeded).contains(&JobStatus::Canceling));
    }

    #[test]
    fn running_is_rerunnable_for_redelivery() {
        assert!(JobStatus::allowed_sources(JobStatus::Running).contains(&JobStatus::Running));
    }

    #[test]
    fn default_sampler_is_euler_ancestral() {
        assert_eq!(Sampler::default().engine_name(), "euler_ancestral");
    }

    #[test]
    fn sampler_wire_values_follow_the_public_fixed_set() {
        for (sampler, wire) in [
            (Sampler::Euler, "euler"),
            (Sampler::EulerAncestral, "euler_ancestral"),
            (Sampler::Dpm2Ancestral, "dpm_2_a"),
            (Sampler::Dpmpp2sAncestral, "dpm_plus_plus_2s_a"),
            (Sampler::Dpmpp2m, "dpm_plus_plus_2m"),
            (Sampler::DpmppSde, "dpm_plus_plus_sde"),
            (Sampler::UniPc, "uni_pc"),
        ] {
            assert_eq!(serde_json::to_value(sampler).unwrap(), wire);
            let parsed: Sampler = serde_json::from_value(serde_json::json!(wire)).unwrap();
            assert_eq!(parsed, sampler);
        }
    }

    #[test]
    fn sampler_accepts_euler_a_as_an_alias() {
        let parsed: Sampler = serde_json::from_value(serde_json::json!("euler_a")).unwrap();
        assert_eq!(parsed, Sampler::EulerAncestral);
    }

    #[test]
    fn sampler_translates_to_engine_identifiers() {
        assert_eq!(Sampler::Dpm2Ancestral.engine_name(), "dpm_2_ancestral");
        assert_eq!(Sampler::Dpmpp2sAncestral.engine_name(), "dpmpp_2s_ancestral");
        assert_eq!(Sampler::Dpmpp2m.engine_name(), "dpmpp_2m");
        assert_eq!(Sampler::DpmppSde.engine_name(), "dpmpp_sde");
    }

    #[test]
    fn params_defaults_apply_on_deserialize() {
        let params: SubmissionParams = serde_json::from_str(r#"{"prompt": "a cat"}"#).unwrap();
        assert_eq!(params.width, 512);
        assert_eq!(params.height, 512);
        assert_eq!(params.steps, 20);
        assert_eq!(params.cfg_scale, 7.0);
        assert_eq!(params.batch_size, 1);
        assert_eq!(params.sampler, Sampler::EulerAncestral);
        assert!(params.seed.is_none());
        assert!(params.model.is_none());
    }

    #[test]
    fn validate_accepts_sane_params() {
        assert!(sample_params().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_prompt() {
        let mut params = sample_params();
        params.prompt = "   ".to_string();
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlong_prompt() {
        let mut params = sample_params();
        params.prompt = "x".repeat(5001);
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_dimension_not_multiple_of_8() {
        let mut params = sample_params();
        params.width = 513;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_dimension() {
        let mut params = sample_params();
        params.height = 4096;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_seed_below_minus_one() {
        let mut params = sample_params();
        params.seed = Some(-2);
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_collapses_blank_negative_prompt() {
        let mut params = sample_params();
        params.negative_prompt = Some("  ".to_string());
        params.validate().unwrap();
        assert!(params.negative_prompt.is_none());
    }

    #[test]
    fn new_record_starts_queued_with_zero_progress() {
        let record = JobRecord::queued(
            "j_abcdefghijkl".to_string(),
            "tok".to_string(),
            "key".to_string(),
            sample_params(),
        );
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.progress, 0.0);
        assert!(record.started_at.is_none());
    }

    #[test]
    fn view_hides_owner_fields_from_non_owners() {
        let record = JobRecord::queued(
            "j_abcdefghijkl".to_string(),
            "tok".to_string(),
            "key".to_string(),
            sample_params(),
        );
        let public = record.view(false);
        assert!(public.submitted_by.is_none());
        assert!(public.params.is_none());

        let owned = record.view(true);
        assert_eq!(owned.submitted_by.as_deref(), Some("tok"));
        assert!(owned.params.is_some());
    }

    #[test]
    fn job_error_kind_serializes_under_the_type_field() {
        let err = JobError::new(JobErrorKind::EngineError, "boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "EngineError");
        assert!(json.get("kind").is_none());
    }
}
