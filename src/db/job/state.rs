use std::fmt;
use std::str::FromStr;

use crate::dispatch::JobStatus;

/// Where a job is in its life as far as the ledger knows
///
/// Staged means the job script was written to disk, submitted means `sbatch` accepted it. The
/// terminal states are only recorded once a status poll observes them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Staged,
    Submitted,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Value of the `state` column
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Staged => "staged",
            JobState::Submitted => "submitted",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Terminal ledger state for a terminal backend status
    pub fn from_status(status: &JobStatus) -> Option<JobState> {
        match status {
            JobStatus::Succeeded => Some(JobState::Succeeded),
            JobStatus::Failed(_) => Some(JobState::Failed),
            JobStatus::Cancelled(_) => Some(JobState::Cancelled),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(JobState::Staged),
            "submitted" => Ok(JobState::Submitted),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state {other}")),
        }
    }
}
