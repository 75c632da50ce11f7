pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;

pub use events::job_events_handler;
pub use health::{health_handler, liveness_handler};
pub use jobs::{cancel_job_handler, create_job_handler, get_job_handler};
pub use metrics::metrics_handler;
