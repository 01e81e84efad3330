//! Turn an authorized submission into a batch job
//!
//! The dispatcher builds a backend-neutral [JobSpec] (image, resources, environment and the
//! command, including the source checkout and review gate) and submits it through a
//! [BatchBackend]. Building is pure, so what a submission will run can be checked without a
//! backend.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::error::RunnerError;
use crate::request::args::AuthorizedJobArgs;
use crate::request::validate::CONFIG_PATH_VAR;
use crate::storage::BlobUri;

/// Job description shared by every backend
pub mod job;
/// Source checkout and the review gate
pub mod git;
/// Batch backend interface
pub mod backend;
/// Backend that keeps jobs in memory, for dry runs and tests
pub mod memory;

pub use backend::{BackendError, BatchBackend, JobStatus, SubmittedJob};
pub use git::{checkout_commands, GitSettings};
pub use job::{JobCommand, JobSpec};

/// Points cloud client libraries at the job's credential
pub const CREDENTIALS_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Scratch directory shared by the jobs of one run, exported by backends that run jobs
pub const RUN_DIR_VAR: &str = "ANALYSIS_RUNNER_RUN_DIR";

pub struct Dispatcher {
    backend: Arc<dyn BatchBackend>,
    git: GitSettings,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn BatchBackend>, git: GitSettings, poll_interval: Duration) -> Dispatcher {
        Dispatcher { backend, git, poll_interval }
    }

    pub fn git(&self) -> &GitSettings {
        &self.git
    }

    /// The driver job for a submission, with the run config at `config_path`
    pub fn driver_job(&self, args: &AuthorizedJobArgs, config_path: &BlobUri) -> JobSpec {
        let submission = &args.submission;
        let command = match (&submission.repo, &submission.commit) {
            (Some(repo), Some(commit)) => JobCommand::Script(self.checkout_script(args, repo, commit)),
            _ => JobCommand::Entrypoint(submission.script.clone()),
        };

        let mut job = JobSpec::new(args.job_name(), submission.image.clone(), command);
        job.cpu = submission.cpu.clone();
        job.memory = submission.memory.clone();
        job.storage = submission.storage.clone();
        job.preemptible = submission.preemptible;
        if matches!(job.command, JobCommand::Entrypoint(_)) {
            job.workdir = submission.cwd.clone();
        }
        job.attributes = args.attributes();

        job.env.push((CONFIG_PATH_VAR.to_string(), config_path.to_string()));
        job.env.push((CREDENTIALS_VAR.to_string(), args.credential.clone()));
        // user variables come last, names the server sets are rejected during validation
        job.env.extend(submission.environment_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        job
    }

    fn checkout_script(&self, args: &AuthorizedJobArgs, repo: &str, commit: &str) -> Vec<String> {
        let submission = &args.submission;
        let mut lines = vec!["set -ex".to_string()];

        if let Some(branch) = &submission.branch {
            lines.push(format!("echo {}", git::quote(&format!("BRANCH: {branch}"))));
        }
        let url = self.git.script_url(repo, commit, submission.cwd.as_deref(), &submission.script[0]);
        lines.push(format!("echo {}", git::quote(&format!("URL: {url}"))));

        lines.push(format!("gcloud -q auth activate-service-account --key-file=\"${CREDENTIALS_VAR}\""));
        lines.extend(checkout_commands(repo, commit, !submission.access_level.is_test(), &self.git));

        if let Some(cwd) = &submission.cwd {
            lines.push(format!("cd {}", git::quote(cwd)));
        }
        let program = git::quote(&submission.script[0]);
        lines.push(format!("which {program} || chmod +x {program}"));
        lines.push(
            submission.script.iter()
                .filter(|token| !token.is_empty())
                .map(|token| git::quote(token))
                .collect::<Vec<_>>()
                .join(" "),
        );
        lines
    }

    /// Build and submit the driver job
    pub async fn dispatch(&self, args: &AuthorizedJobArgs, config_path: &BlobUri) -> Result<SubmittedJob, RunnerError> {
        let job = self.driver_job(args, config_path);
        self.submit(&args.run_id, &job).await
    }

    pub async fn submit(&self, run_id: &str, job: &JobSpec) -> Result<SubmittedJob, RunnerError> {
        let submitted = self.backend
            .submit(run_id, job)
            .await?;
        info!("Submitted {} as job {} ({})", job.name, submitted.job_id, submitted.url);
        Ok(submitted)
    }

    /// Block until the job is terminal, failing unless it succeeded
    pub async fn wait(&self, job: &SubmittedJob) -> Result<(), RunnerError> {
        info!("Waiting for job {}", job.job_id);
        loop {
            let status = self.backend.status(&job.job_id).await?;
            match status {
                JobStatus::Succeeded => return Ok(()),
                status if status.is_terminal() => {
                    warn!("Job {} ended unsuccessfully: {}", job.job_id, status);
                    return Err(RunnerError::Dispatch(format!("Job {} {}, see {}", job.job_id, status, job.url)));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}
