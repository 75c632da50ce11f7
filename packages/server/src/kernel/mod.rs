// Kernel - core infrastructure with dependency injection
//
// Everything here is infrastructure: the state store gateway, the durable
// queue, the engine and object-store adapters, the progress event bus and
// the worker runtime. HTTP concerns live in `server`; the traits in this
// module are the seams the test doubles plug into.

pub mod engine;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod store;

pub mod jobs;

pub use events::{EventBus, LocalEventBus, NatsEventBus, ProgressEvent};
pub use queue::{JobQueue, LeasedJob, PostgresJobQueue};
pub use store::{JobStore, JobUpdate, PostgresJobStore, StoreError};
