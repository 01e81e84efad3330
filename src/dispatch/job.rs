use std::collections::BTreeMap;

use crate::request::submission::ResourceValue;

/// One executable unit handed to a batch backend
///
/// Backend neutral: the SLURM backend turns it into an sbatch script, a test backend just keeps it.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub cpu: Option<ResourceValue>,
    pub memory: Option<ResourceValue>,
    pub storage: Option<ResourceValue>,
    pub preemptible: bool,
    /// Exported in order, so later entries win
    pub env: Vec<(String, String)>,
    pub command: JobCommand,
    /// Working directory for [JobCommand::Entrypoint]
    pub workdir: Option<String>,
    pub attributes: BTreeMap<String, String>,
    /// Backend job ids that have to succeed before this job starts
    pub depends_on: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobCommand {
    /// Shell lines run in order by bash inside the image
    Script(Vec<String>),
    /// Arguments appended to the image's own entrypoint
    Entrypoint(Vec<String>),
}

impl JobSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, command: JobCommand) -> JobSpec {
        JobSpec {
            name: name.into(),
            image: image.into(),
            cpu: None,
            memory: None,
            storage: None,
            preemptible: true,
            env: Vec::new(),
            command,
            workdir: None,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Value of an environment variable as the job will see it
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.iter().rev().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Shell lines, empty for an entrypoint job
    pub fn script_lines(&self) -> &[String] {
        match &self.command {
            JobCommand::Script(lines) => lines,
            JobCommand::Entrypoint(_) => &[],
        }
    }
}
