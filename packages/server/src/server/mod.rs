// HTTP surface: application router, middleware and route handlers.

pub mod app;
pub mod middleware;
pub mod routes;

pub use app::{build_app, AppOptions, AppState};
