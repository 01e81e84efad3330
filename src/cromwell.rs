//! Long-running workflows on the Cromwell engine
//!
//! `POST /cromwell` dispatches two jobs: one checks out the repository and submits the workflow
//! through the worker binary, the other waits for it and polls the engine until the workflow is
//! terminal. The server itself only proxies metadata requests.

/// Engine REST client
pub mod client;
/// Status polling with eased backoff
pub mod watch;
/// Submit and watch job assembly
pub mod job;
pub mod worker;

pub use client::{CromwellClient, CromwellError};
pub use watch::{poll_interval, watch_workflow, BackoffSettings, WatchError, WatchSettings, WorkflowEngine, WorkflowStatus};
