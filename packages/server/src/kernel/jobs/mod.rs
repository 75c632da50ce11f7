//! Job lifecycle: records, submission, cancellation and the worker runtime.
//!
//! ```text
//! client ──► SubmissionService ──► JobStore + JobQueue
//!                                        │
//!                              WorkerPool dequeues
//!                                        │
//!                 EngineClient ──► ArtifactStore ──► terminal write
//!                                        │
//!                               EventBus ──► streaming clients
//! ```

pub mod cancel;
pub mod job;
pub mod submit;
pub mod testing;
pub mod worker;

pub use cancel::{CancelOutcome, CancellationService};
pub use job::{
    JobArtifact, JobError, JobErrorKind, JobRecord, JobResult, JobStatus, JobTimestamps, JobView,
    Sampler, SubmissionParams,
};
pub use submit::{SubmissionReceipt, SubmissionService};
pub use worker::{RecoveryPolicy, WorkerConfig, WorkerPool};
