use std::path::{Path, PathBuf};
use std::process::Output;

use log::{info, warn};
use tokio::fs;
use tokio::process::Command;

use crate::dispatch::{BackendError, JobStatus};
use crate::slurm::script::{JobDirs, RenderedJob};

/// Write a rendered job into its directory, replacing anything left from an earlier attempt
pub async fn stage(dirs: &JobDirs, job: &RenderedJob) -> std::io::Result<PathBuf> {
    info!("Creating job in working directory {}", dirs.job_dir.display());
    if fs::try_exists(&dirs.job_dir).await? {
        warn!("Job directory already exists, files will be overwritten");
        fs::remove_dir_all(&dirs.job_dir).await?;
    }
    fs::create_dir_all(&dirs.job_dir).await?;

    let path = dirs.script_path();
    fs::write(&path, &job.script).await?;
    if let Some(command) = &job.command {
        fs::write(dirs.command_path(), command).await?;
    }
    Ok(path)
}

/// Run `sbatch --parsable` and return the scheduler's job id
pub async fn run_sbatch(sbatch: &Path, name: &str, depends_on: &[String], script: &Path) -> Result<String, BackendError> {
    let mut cmd = Command::new(sbatch);
    cmd.arg("--parsable").arg(format!("--job-name={name}"));
    if !depends_on.is_empty() {
        cmd.arg(format!("--dependency=afterok:{}", depends_on.join(":")));
    }
    cmd.arg(script);
    info!("Running sbatch process {:?}", cmd.as_std());

    let output = run(cmd, "sbatch").await?;
    if !output.status.success() {
        return Err(BackendError::Rejected(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    parse_job_id(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| BackendError::Rejected("sbatch didn't print a job id".to_string()))
}

/// Ask accounting for a job's state
pub async fn run_sacct(sacct: &Path, job_id: &str) -> Result<JobStatus, BackendError> {
    let mut cmd = Command::new(sacct);
    cmd.args(["-j", job_id, "-X", "-n", "-P", "-o", "State"]);
    let output = run(cmd, "sacct").await?;
    if !output.status.success() {
        return Err(BackendError::Unavailable(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    Ok(parse_state(&String::from_utf8_lossy(&output.stdout)))
}

async fn run(mut cmd: Command, program: &str) -> Result<Output, BackendError> {
    cmd.output()
        .await
        .map_err(|err| BackendError::Unavailable(format!("failed to execute {program}: {err}")))
}

/// `--parsable` prints `id` or `id;cluster`
fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Map an accounting state such as `COMPLETED` or `CANCELLED by 1000`
///
/// A job accounting doesn't know about yet prints nothing and counts as pending.
fn parse_state(stdout: &str) -> JobStatus {
    let state = stdout.lines().next().unwrap_or("").trim();
    let code = state.split_whitespace().next().unwrap_or("");
    match code {
        "" | "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD" | "SUSPENDED" | "PREEMPTED" => JobStatus::Pending,
        "RUNNING" | "COMPLETING" | "CONFIGURING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => JobStatus::Running,
        "COMPLETED" => JobStatus::Succeeded,
        "CANCELLED" => JobStatus::Cancelled(state.to_string()),
        _ => JobStatus::Failed(state.to_string()),
    }
}
