use std::fmt;

use async_trait::async_trait;

use crate::dispatch::job::JobSpec;
use crate::error::RunnerError;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend refused the job, carrying its own diagnostic text
    #[error("job was rejected: {0}")]
    Rejected(String),
    #[error("can't reach the batch backend: {0}")]
    Unavailable(String),
    #[error("unknown job {0}")]
    UnknownJob(String),
}

impl From<BackendError> for RunnerError {
    fn from(err: BackendError) -> Self {
        RunnerError::Dispatch(err.to_string())
    }
}

/// A job the backend accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    /// Where a person can follow the job
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Cancelled(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed(reason) => write!(f, "failed ({reason})"),
            JobStatus::Cancelled(reason) => write!(f, "cancelled ({reason})"),
        }
    }
}

/// The narrow surface the server needs from a batch execution system
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Create and submit a job, `run_id` groups the jobs of one submission
    async fn submit(&self, run_id: &str, job: &JobSpec) -> Result<SubmittedJob, BackendError>;

    async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError>;
}
