use std::collections::BTreeMap;

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::dispatch::backend::{BackendError, BatchBackend, JobStatus, SubmittedJob};
use crate::dispatch::job::JobSpec;

/// Accepts every job without running it
///
/// Used for `--dry-run` and in tests. Jobs report success straight away unless a status is set.
#[derive(Default)]
pub struct MemoryBackend {
    jobs: Mutex<Vec<(String, JobSpec)>>,
    statuses: Mutex<BTreeMap<String, JobStatus>>,
    reject: Option<String>,
    /// Status of jobs without one of their own, success when unset
    outcome: Option<JobStatus>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// A backend that refuses every job with `reason`
    pub fn rejecting(reason: &str) -> MemoryBackend {
        MemoryBackend { reject: Some(reason.to_string()), ..MemoryBackend::default() }
    }

    /// A backend whose jobs all end with `status`
    pub fn finishing_with(status: JobStatus) -> MemoryBackend {
        MemoryBackend { outcome: Some(status), ..MemoryBackend::default() }
    }

    /// Submitted jobs with their run ids, in submission order
    pub async fn jobs(&self) -> Vec<(String, JobSpec)> {
        self.jobs.lock().await.clone()
    }

    pub async fn set_status(&self, job_id: &str, status: JobStatus) {
        self.statuses.lock().await.insert(job_id.to_string(), status);
    }
}

#[async_trait]
impl BatchBackend for MemoryBackend {
    async fn submit(&self, run_id: &str, job: &JobSpec) -> Result<SubmittedJob, BackendError> {
        if let Some(reason) = &self.reject {
            return Err(BackendError::Rejected(reason.clone()));
        }
        let mut jobs = self.jobs.lock().await;
        jobs.push((run_id.to_string(), job.clone()));
        let job_id = jobs.len().to_string();
        info!("Dry run: accepted job {job_id} ({})", job.name);
        Ok(SubmittedJob { url: format!("memory://{run_id}/jobs/{job_id}"), job_id })
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        let submitted = self.jobs.lock().await.len();
        let known = job_id.parse::<usize>().is_ok_and(|n| n >= 1 && n <= submitted);
        if !known {
            return Err(BackendError::UnknownJob(job_id.to_string()));
        }
        let status = self.statuses.lock().await.get(job_id).cloned();
        Ok(status.or_else(|| self.outcome.clone()).unwrap_or(JobStatus::Succeeded))
    }
}
