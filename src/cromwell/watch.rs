//! Poll a workflow to a terminal state
//!
//! The watcher runs as its own batch job and keeps no state apart from the workflow id it was
//! given, so a restarted job simply starts watching again.

use std::f64::consts::PI;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use tokio::time::Instant;

use crate::cromwell::client::CromwellError;
use crate::error::RunnerError;
use crate::storage::{BlobStore, BlobUri};

/// Workflow states as the engine reports them
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkflowStatus {
    Submitted,
    Running,
    Aborting,
    Succeeded,
    Failed,
    Aborted,
    Other(String),
}

impl WorkflowStatus {
    pub fn parse(status: &str) -> WorkflowStatus {
        match status {
            "Submitted" => WorkflowStatus::Submitted,
            "Running" => WorkflowStatus::Running,
            "Aborting" => WorkflowStatus::Aborting,
            "Succeeded" => WorkflowStatus::Succeeded,
            "Failed" => WorkflowStatus::Failed,
            "Aborted" => WorkflowStatus::Aborted,
            other => WorkflowStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkflowStatus::Submitted => write!(f, "Submitted"),
            WorkflowStatus::Running => write!(f, "Running"),
            WorkflowStatus::Aborting => write!(f, "Aborting"),
            WorkflowStatus::Succeeded => write!(f, "Succeeded"),
            WorkflowStatus::Failed => write!(f, "Failed"),
            WorkflowStatus::Aborted => write!(f, "Aborted"),
            WorkflowStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

/// What the watcher needs from the engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus, CromwellError>;

    async fn outputs(&self, workflow_id: &str) -> Result<Value, CromwellError>;

    async fn metadata(&self, workflow_id: &str) -> Result<Value, CromwellError>;
}

#[derive(Clone, Debug)]
pub struct BackoffSettings {
    pub min: Duration,
    pub max: Duration,
    /// Elapsed time after which the interval stays at `max`
    pub horizon: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            min: Duration::from_secs(5),
            max: Duration::from_secs(60),
            horizon: Duration::from_secs(60 * 60),
        }
    }
}

/// Wait before the next poll, easing from `min` to `max` along half a cosine over `horizon`
pub fn poll_interval(elapsed: Duration, settings: &BackoffSettings) -> Duration {
    let min = settings.min.as_secs_f64();
    let max = settings.max.as_secs_f64().max(min);
    if settings.horizon.is_zero() {
        return Duration::from_secs_f64(max);
    }
    let factor = elapsed.as_secs_f64() / settings.horizon.as_secs_f64();
    if factor >= 1.0 {
        return Duration::from_secs_f64(max);
    }
    let eased = (1.0 - (PI * factor).cos()) / 2.0;
    Duration::from_secs_f64(min + (max - min) * eased)
}

#[derive(Clone, Debug)]
pub struct WatchSettings {
    pub backoff: BackoffSettings,
    /// Transient failures tolerated over the whole watch
    pub max_failures: u32,
}

impl Default for WatchSettings {
    fn default() -> Self {
        WatchSettings { backoff: BackoffSettings::default(), max_failures: 10 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The engine says the workflow didn't succeed
    #[error("workflow {workflow_id} ended as {status}")]
    Workflow { workflow_id: String, status: WorkflowStatus },
    #[error("gave up on workflow {workflow_id} after {failures} failed attempts, last error: {last}")]
    RetriesExhausted { workflow_id: String, failures: u32, last: String },
}

impl From<WatchError> for RunnerError {
    fn from(err: WatchError) -> Self {
        RunnerError::Workflow(err.to_string())
    }
}

/// Poll until the workflow is terminal, then persist its outputs as JSON at `output`
///
/// Failed and aborted workflows end the watch straight away. Failures to reach the engine, or to
/// fetch or store the outputs, are retried on the same schedule until the budget runs out.
pub async fn watch_workflow(
    engine: &dyn WorkflowEngine,
    store: &dyn BlobStore,
    workflow_id: &str,
    output: &BlobUri,
    settings: &WatchSettings,
) -> Result<Value, WatchError> {
    let start = Instant::now();
    let mut failures = 0;
    let mut last_status = None;

    loop {
        let attempt = match engine.status(workflow_id).await {
            Ok(WorkflowStatus::Succeeded) => match collect_outputs(engine, store, workflow_id, output).await {
                Ok(outputs) => return Ok(outputs),
                Err(err) => Err(err),
            },
            Ok(status @ (WorkflowStatus::Failed | WorkflowStatus::Aborted)) => {
                return Err(WatchError::Workflow { workflow_id: workflow_id.to_string(), status });
            }
            Ok(status) => {
                if last_status.as_ref() != Some(&status) {
                    info!("Workflow {workflow_id} is {status}");
                    last_status = Some(status);
                }
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        };

        if let Err(err) = attempt {
            failures += 1;
            warn!("Attempt on workflow {workflow_id} failed ({failures}/{}): {err}", settings.max_failures);
            if failures >= settings.max_failures {
                return Err(WatchError::RetriesExhausted { workflow_id: workflow_id.to_string(), failures, last: err });
            }
        }

        tokio::time::sleep(poll_interval(start.elapsed(), &settings.backoff)).await;
    }
}

async fn collect_outputs(engine: &dyn WorkflowEngine, store: &dyn BlobStore, workflow_id: &str, output: &BlobUri) -> Result<Value, String> {
    let outputs = engine.outputs(workflow_id).await.map_err(|err| err.to_string())?;
    let body = serde_json::to_vec_pretty(&outputs).map_err(|err| err.to_string())?;
    store.put(output, body, "application/json").await.map_err(|err| err.to_string())?;
    info!("Workflow {workflow_id} succeeded, outputs written to {output}");
    Ok(outputs)
}
