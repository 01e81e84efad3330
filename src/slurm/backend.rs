use std::path::PathBuf;

use async_trait::async_trait;
use log::warn;

use crate::db::{JobLedger, JobState};
use crate::dispatch::{BackendError, BatchBackend, JobSpec, JobStatus, SubmittedJob};
use crate::slurm::job::{run_sacct, run_sbatch, stage};
use crate::slurm::script::{render, JobDirs};

#[derive(Clone, Debug)]
pub struct SlurmSettings {
    /// Run directories are created below this
    pub work_dir: PathBuf,
    pub partition: String,
    pub sbatch: PathBuf,
    pub sacct: PathBuf,
    /// Tracking URLs are `{tracking_url}/jobs/{id}`
    pub tracking_url: String,
}

pub struct SlurmBackend {
    settings: SlurmSettings,
    ledger: JobLedger,
}

impl SlurmBackend {
    pub fn new(settings: SlurmSettings, ledger: JobLedger) -> SlurmBackend {
        SlurmBackend { settings, ledger }
    }

    fn dirs(&self, run_id: &str) -> Result<JobDirs, BackendError> {
        let index = self.ledger.count(run_id).map_err(ledger_error)? + 1;
        let run_dir = self.settings.work_dir.join(run_id);
        let job_dir = run_dir.join(format!("job-{index}"));
        Ok(JobDirs { run_dir, job_dir })
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }
}

#[async_trait]
impl BatchBackend for SlurmBackend {
    async fn submit(&self, run_id: &str, job: &JobSpec) -> Result<SubmittedJob, BackendError> {
        let dirs = self.dirs(run_id)?;
        let rendered = render(job, &dirs, &self.settings.partition)
            .map_err(|err| BackendError::Rejected(format!("can't render job script: {err}")))?;
        let script = stage(&dirs, &rendered)
            .await
            .map_err(|err| BackendError::Unavailable(format!("can't stage job script: {err}")))?;
        let id = self.ledger.stage(run_id, &job.name, &script).map_err(ledger_error)?;

        let job_id = run_sbatch(&self.settings.sbatch, &job.name, &job.depends_on, &script).await?;
        self.ledger.submit(id, &job_id).map_err(ledger_error)?;

        let url = format!("{}/jobs/{}", self.settings.tracking_url.trim_end_matches('/'), job_id);
        Ok(SubmittedJob { job_id, url })
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        if self.ledger.get_by_batch_id(job_id).map_err(ledger_error)?.is_none() {
            return Err(BackendError::UnknownJob(job_id.to_string()));
        }
        let status = run_sacct(&self.settings.sacct, job_id).await?;
        if let Some(state) = JobState::from_status(&status) {
            // the scheduler already knows, a ledger hiccup shouldn't hide that
            if let Err(err) = self.ledger.finish(job_id, state) {
                warn!("Can't record state of job {job_id}: {err}");
            }
        }
        Ok(status)
    }
}

fn ledger_error(err: rusqlite::Error) -> BackendError {
    BackendError::Unavailable(format!("job ledger: {err}"))
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::db::open_db;
    use crate::dispatch::JobCommand;
    use crate::request::submission::ResourceValue;

    fn fake_command(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn backend(dir: &Path, sbatch_body: &str) -> SlurmBackend {
        backend_with_sacct(dir, sbatch_body, "echo COMPLETED")
    }

    fn backend_with_sacct(dir: &Path, sbatch_body: &str, sacct_body: &str) -> SlurmBackend {
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let settings = SlurmSettings {
            work_dir: dir.join("work"),
            partition: "batch".to_string(),
            sbatch: fake_command(&bin, "sbatch", sbatch_body),
            sacct: fake_command(&bin, "sacct", sacct_body),
            tracking_url: "https://slurm.example.org/".to_string(),
        };
        SlurmBackend::new(settings, JobLedger::new(open_db(dir).unwrap()))
    }

    #[tokio::test]
    async fn submits_and_tracks_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "echo \"$@\" > \"$(dirname \"$0\")/args\"; echo '4242;cluster'");
        let job = JobSpec::new("alice fewgenomes:abc/main.py", "driver:1", JobCommand::Script(vec!["true".to_string()]));

        let submitted = backend.submit("run-1", &job).await.unwrap();
        assert_eq!(submitted.job_id, "4242");
        assert_eq!(submitted.url, "https://slurm.example.org/jobs/4242");
        assert!(dir.path().join("work/run-1/job-1/job.sh").exists());
        assert!(dir.path().join("work/run-1/job-1/command.sh").exists());

        let args = std::fs::read_to_string(dir.path().join("bin/args")).unwrap();
        assert!(args.contains("--job-name=alice fewgenomes:abc/main.py"));

        assert_eq!(backend.status("4242").await.unwrap(), JobStatus::Succeeded);
        let record = backend.ledger().get_by_batch_id("4242").unwrap().unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(matches!(backend.status("1").await, Err(BackendError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn second_job_of_a_run_gets_its_own_directory_and_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "echo \"$@\" >> \"$(dirname \"$0\")/args\"; echo 7");
        let first = JobSpec::new("submit", "driver:1", JobCommand::Script(vec!["true".to_string()]));
        backend.submit("run-1", &first).await.unwrap();

        let mut second = JobSpec::new("watch", "driver:1", JobCommand::Script(vec!["true".to_string()]));
        second.depends_on = vec!["7".to_string()];
        backend.submit("run-1", &second).await.unwrap();

        assert!(dir.path().join("work/run-1/job-2/job.sh").exists());
        let args = std::fs::read_to_string(dir.path().join("bin/args")).unwrap();
        assert!(args.contains("--dependency=afterok:7"));
    }

    #[tokio::test]
    async fn rejected_submission_carries_scheduler_message() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "echo 'sbatch: error: invalid partition' >&2; exit 1");
        let job = JobSpec::new("driver", "driver:1", JobCommand::Entrypoint(vec![]));
        let err = backend.submit("run-1", &job).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(ref m) if m.contains("invalid partition")));
    }

    #[tokio::test]
    async fn ledger_follows_accounting_to_a_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_sacct(dir.path(), "echo 99", "cat \"$(dirname \"$0\")/state\"");
        let job = JobSpec::new("driver", "driver:1", JobCommand::Entrypoint(vec![]));
        backend.submit("run-1", &job).await.unwrap();
        let state_file = dir.path().join("bin/state");

        std::fs::write(&state_file, "RUNNING\n").unwrap();
        assert_eq!(backend.status("99").await.unwrap(), JobStatus::Running);
        assert_eq!(backend.ledger().get_by_batch_id("99").unwrap().unwrap().state, JobState::Submitted);

        std::fs::write(&state_file, "OUT_OF_MEMORY\n").unwrap();
        assert_eq!(backend.status("99").await.unwrap(), JobStatus::Failed("OUT_OF_MEMORY".to_string()));
        assert_eq!(backend.ledger().get_by_batch_id("99").unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn accounting_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_sacct(dir.path(), "echo 5", "echo 'slurmdbd down' >&2; exit 1");
        backend.submit("run-1", &JobSpec::new("driver", "driver:1", JobCommand::Entrypoint(vec![]))).await.unwrap();
        assert!(matches!(backend.status("5").await, Err(BackendError::Unavailable(ref m)) if m.contains("slurmdbd down")));
    }

    #[tokio::test]
    async fn unrenderable_job_never_reaches_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "touch \"$(dirname \"$0\")/called\"; echo 1");
        let mut job = JobSpec::new("driver", "driver:1", JobCommand::Entrypoint(vec![]));
        job.memory = Some(ResourceValue::Text("8G\ntouch /tmp/outside".to_string()));

        let err = backend.submit("run-1", &job).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(ref m) if m.contains("memory")));
        assert!(!dir.path().join("bin/called").exists());
    }
}
