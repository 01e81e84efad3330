use std::collections::BTreeMap;

use rand::Rng;
use uuid::Uuid;

use crate::policy::DatasetEnvConfig;
use crate::request::validate::{ValidatedSubmission, ValidatedWorkflow};

/// Generate a run id: a lower case v4 UUID that never starts with a digit
///
/// Cloud resource labels can't start with a digit, and the run id ends up in several of them.
pub fn generate_run_id() -> String {
    let id = Uuid::new_v4().to_string();
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_digit() => {
            let letter = rand::thread_rng().gen_range(b'a'..=b'f') as char;
            std::iter::once(letter).chain(chars).collect()
        }
        _ => id,
    }
}

/// Everything needed to configure and dispatch one submission
///
/// Built once per request after validation and authorization both succeeded, then only read.
#[derive(Clone, Debug)]
pub struct AuthorizedJobArgs {
    pub run_id: String,
    pub email: String,
    pub submission: ValidatedSubmission,
    pub gcp_project: String,
    /// Credential reference for the requested access level, never its value
    pub credential: String,
}

/// [AuthorizedJobArgs] for a workflow engine submission
#[derive(Clone, Debug)]
pub struct AuthorizedWorkflowArgs {
    pub run_id: String,
    pub email: String,
    pub workflow: ValidatedWorkflow,
    pub gcp_project: String,
    pub credential: String,
}

impl AuthorizedJobArgs {
    pub fn new(run_id: String, email: String, submission: ValidatedSubmission, dataset: DatasetEnvConfig) -> AuthorizedJobArgs {
        let gcp_project = dataset.project_id.unwrap_or_else(|| submission.dataset.clone());
        AuthorizedJobArgs { run_id, email, submission, gcp_project, credential: dataset.credential }
    }

    pub fn user_name(&self) -> &str {
        user_name(&self.email)
    }

    /// `"{user} {repo}:{commit}/{script}"`, or the image in place of the source when there's no repo
    pub fn job_name(&self) -> String {
        let source = match (&self.submission.repo, &self.submission.commit) {
            (Some(repo), Some(commit)) => format!("{repo}:{commit}"),
            _ => self.submission.image.clone(),
        };
        format!("{} {}/{}", self.user_name(), source, self.submission.script.join(" "))
    }

    pub fn attributes(&self) -> BTreeMap<String, String> {
        attributes(
            &self.run_id,
            &self.email,
            self.submission.repo.as_deref(),
            self.submission.commit.as_deref(),
            self.submission.branch.as_deref(),
        )
    }
}

impl AuthorizedWorkflowArgs {
    pub fn new(run_id: String, email: String, workflow: ValidatedWorkflow, dataset: DatasetEnvConfig) -> AuthorizedWorkflowArgs {
        let gcp_project = dataset.project_id.unwrap_or_else(|| workflow.dataset.clone());
        AuthorizedWorkflowArgs { run_id, email, workflow, gcp_project, credential: dataset.credential }
    }

    pub fn user_name(&self) -> &str {
        user_name(&self.email)
    }

    pub fn job_name(&self) -> String {
        format!("{} {}:{}/cromwell/{}", self.user_name(), self.workflow.repo, self.workflow.commit, self.workflow.workflow)
    }

    pub fn attributes(&self) -> BTreeMap<String, String> {
        attributes(
            &self.run_id,
            &self.email,
            Some(&self.workflow.repo),
            Some(&self.workflow.commit),
            self.workflow.branch.as_deref(),
        )
    }
}

fn user_name(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

fn attributes(run_id: &str, email: &str, repo: Option<&str>, commit: Option<&str>, branch: Option<&str>) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::from([
        ("ar-guid".to_string(), run_id.to_string()),
        ("author".to_string(), email.to_string()),
    ]);
    for (key, value) in [("repo", repo), ("commit", commit), ("branch", branch)] {
        if let Some(value) = value {
            attributes.insert(key.to_string(), value.to_string());
        }
    }
    attributes
}
