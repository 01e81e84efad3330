use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tinytemplate::TinyTemplate;

use crate::dispatch::git::quote;
use crate::dispatch::{JobCommand, JobSpec};

/// Directories a job script refers to
///
/// Jobs of one run share the run directory, which is how the workflow watcher finds the handle
/// written by the submit job. Each job gets its own directory below it.
#[derive(Clone, Debug)]
pub struct JobDirs {
    pub run_dir: PathBuf,
    pub job_dir: PathBuf,
}

impl JobDirs {
    pub fn script_path(&self) -> PathBuf {
        self.job_dir.join("job.sh")
    }

    pub fn command_path(&self) -> PathBuf {
        self.job_dir.join("command.sh")
    }

    pub fn log_path(&self) -> PathBuf {
        self.job_dir.join("job.log")
    }
}

/// A job script ready to be written to disk
#[derive(Debug)]
pub struct RenderedJob {
    /// Passed to `sbatch`
    pub script: String,
    /// Run inside the container, only for [JobCommand::Script]
    pub command: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Template(#[from] tinytemplate::error::Error),
    #[error("{0} can't contain control characters")]
    ControlCharacter(String),
    #[error("\"{0}\" is not a valid environment variable name")]
    VariableName(String),
}

/// Rendering context for the SBATCH header
///
/// Header values end up unquoted in `#SBATCH` lines, so none of them may span lines. A value SLURM
/// can't parse makes `sbatch` reject the job, which is reported back as a dispatch error.
#[derive(Serialize)]
struct HeaderContext {
    partition: String,
    log_path: String,
    cpus: Option<String>,
    memory: Option<String>,
    storage: Option<String>,
    requeue: bool,
    time_now: String,
    attributes: Vec<String>,
}

/// Rendering context for exported variables, values are already shell quoted
///
/// Job variables are exported with the `APPTAINERENV_` prefix and the container runs with
/// `--cleanenv`, so they are only ever set inside the container.
#[derive(Serialize)]
struct EnvVarContext {
    run_dir: String,
    env: Vec<String>,
}

#[derive(Serialize)]
struct LaunchContext {
    job_dir: String,
    run_dir: String,
    image: String,
    entrypoint: bool,
    workdir: Option<String>,
    arguments: String,
    command_path: String,
}

static HEADER: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/header.txt"));
static ENV_VARS: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/env_vars.txt"));
static LAUNCH: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/launch.txt"));

/// Render the sbatch script (header, exported variables, container launch) for a job
pub fn render(job: &JobSpec, dirs: &JobDirs, partition: &str) -> Result<RenderedJob, ScriptError> {
    let mut tt = TinyTemplate::new();
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_template("header", HEADER)?;
    tt.add_template("env_vars", ENV_VARS)?;
    tt.add_template("launch", LAUNCH)?;

    let header = HeaderContext {
        partition: partition.to_string(),
        log_path: path_string(&dirs.log_path()),
        cpus: job.cpu.as_ref().map(ToString::to_string),
        memory: job.memory.as_ref().map(ToString::to_string),
        storage: job.storage.as_ref().map(ToString::to_string),
        requeue: job.preemptible,
        time_now: Utc::now().to_rfc3339(),
        attributes: job.attributes.iter().map(|(key, value)| comment(&format!("{key}: {value}"))).collect(),
    };
    single_line("partition", &header.partition)?;
    single_line("log path", &header.log_path)?;
    for (field, value) in [("cpu", &header.cpus), ("memory", &header.memory), ("storage", &header.storage)] {
        if let Some(value) = value {
            single_line(field, value)?;
        }
    }
    if let Some((name, _)) = job.env.iter().find(|(name, _)| !is_variable_name(name)) {
        return Err(ScriptError::VariableName(name.clone()));
    }

    let vars = EnvVarContext {
        run_dir: quote(&path_string(&dirs.run_dir)),
        env: job.env.iter().map(|(name, value)| format!("{name}={}", quote(value))).collect(),
    };
    let (entrypoint, arguments, command) = match &job.command {
        JobCommand::Script(lines) => (false, String::new(), Some(lines.join("\n") + "\n")),
        JobCommand::Entrypoint(argv) => (true, argv.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" "), None),
    };
    let launch = LaunchContext {
        job_dir: quote(&path_string(&dirs.job_dir)),
        run_dir: quote(&path_string(&dirs.run_dir)),
        image: quote(&format!("docker://{}", job.image)),
        entrypoint,
        workdir: job.workdir.as_deref().map(quote),
        arguments,
        command_path: quote(&path_string(&dirs.command_path())),
    };

    // order is important when writing the file
    let script = [
        tt.render("header", &header)?,
        tt.render("env_vars", &vars)?,
        tt.render("launch", &launch)?,
    ].concat();

    Ok(RenderedJob { script, command })
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn single_line(field: &str, value: &str) -> Result<(), ScriptError> {
    if value.chars().any(char::is_control) {
        return Err(ScriptError::ControlCharacter(field.to_string()));
    }
    Ok(())
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Keep caller-supplied text on a single comment line
fn comment(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}
