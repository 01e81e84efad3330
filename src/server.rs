//! HTTP surface
//!
//! Every submission endpoint runs the same pipeline: identify the caller, check the body against
//! its schema, authorize against the current server config, normalise the fields, then assemble,
//! dispatch and record. The first failing step is the response.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};

/// Shared handler state
pub mod state;
/// `POST /`, `POST /config` and `GET /health`
pub mod routes;
/// Workflow endpoints
pub mod cromwell;
pub mod logging;

pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(routes::submit))
        .route("/config", post(routes::preview_config))
        .route("/cromwell", post(cromwell::submit_workflow))
        .route("/cromwell/:workflow_id/metadata", get(cromwell::workflow_metadata))
        .route("/health", get(routes::health))
        .layer(middleware::from_fn(logging::log_requests))
        .with_state(state)
}
