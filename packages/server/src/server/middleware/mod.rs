pub mod auth;
pub mod request_id;

pub use auth::{owner_middleware, Owner};
pub use request_id::propagate_request_id;
