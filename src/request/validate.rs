//! Field-level normalisation of typed requests
//!
//! Runs before and independently of authorization. Every failure names the field it's about and
//! is a terminal response for the request.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde_json::Value;

use crate::dispatch::{CREDENTIALS_VAR, RUN_DIR_VAR};
use crate::error::RunnerError;
use crate::namespace::{AccessLevel, CloudEnvironment};
use crate::request::submission::{ConfigRequest, CromwellRequest, ResourceValue, SubmissionRequest};

/// Environment variable carrying the run config location into a job, users can't set it
pub const CONFIG_PATH_VAR: &str = "CPG_CONFIG_PATH";

/// Variables set by the server or read by the container runtime
const RESERVED_VARS: [&str; 3] = [CONFIG_PATH_VAR, CREDENTIALS_VAR, RUN_DIR_VAR];
const RESERVED_VAR_PREFIXES: [&str; 2] = ["APPTAINER", "SINGULARITY"];

/// Script run when a request doesn't name one
pub const DEFAULT_SCRIPT: &str = "main.py";

#[derive(Clone, Debug)]
pub struct ValidationPolicy {
    /// Every output prefix starts with this, e.g. `gs://cpg-`
    pub output_root: String,
    /// Images allowed above the test access level
    pub allowed_image_prefixes: Vec<String>,
    /// Image used at the test access level when none is given
    pub driver_image: String,
    pub default_environment: CloudEnvironment,
}

/// A submission whose fields are all well-formed
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedSubmission {
    pub dataset: String,
    pub output_prefix: String,
    pub access_level: AccessLevel,
    pub cloud_environment: CloudEnvironment,
    pub repo: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub cwd: Option<String>,
    pub script: Vec<String>,
    pub description: String,
    pub image: String,
    pub cpu: Option<ResourceValue>,
    pub memory: Option<ResourceValue>,
    pub storage: Option<ResourceValue>,
    pub preemptible: bool,
    pub environment_variables: BTreeMap<String, String>,
    pub config: Option<Value>,
    pub wait: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedConfigRequest {
    pub dataset: String,
    pub output_prefix: String,
    pub access_level: AccessLevel,
    pub cloud_environment: CloudEnvironment,
    pub image: String,
    pub config: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedWorkflow {
    pub dataset: String,
    pub output_prefix: String,
    pub access_level: AccessLevel,
    pub cloud_environment: CloudEnvironment,
    pub repo: String,
    pub commit: String,
    pub branch: Option<String>,
    pub cwd: Option<String>,
    pub description: String,
    pub workflow: String,
    pub input_json_paths: Vec<String>,
    pub inputs_dict: Option<Value>,
    pub dependencies: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub config: Option<Value>,
    pub wait: bool,
}

pub fn normalize_submission(request: SubmissionRequest, policy: &ValidationPolicy) -> Result<ValidatedSubmission, RunnerError> {
    let output_prefix = output_prefix(&request.output, &policy.output_root)?;
    let repo = non_empty(request.repo);
    let commit = commit(repo.as_deref(), non_empty(request.commit))?;
    let image = image(request.image.as_deref(), request.access_level, policy)?;

    Ok(ValidatedSubmission {
        dataset: request.dataset,
        output_prefix,
        access_level: request.access_level,
        cloud_environment: request.cloud_environment.unwrap_or(policy.default_environment),
        repo,
        commit,
        branch: non_empty(request.branch),
        cwd: cwd(non_empty(request.cwd))?,
        script: script(request.script.unwrap_or_default()),
        description: request.description,
        image,
        cpu: resource("cpu", request.cpu)?,
        memory: resource("memory", request.memory)?,
        storage: resource("storage", request.storage)?,
        preemptible: request.preemptible.unwrap_or(true),
        environment_variables: environment_variables(request.environment_variables.unwrap_or_default())?,
        config: request.config.map(Value::Object),
        wait: request.wait.unwrap_or(false),
    })
}

pub fn normalize_config_request(request: ConfigRequest, policy: &ValidationPolicy) -> Result<ValidatedConfigRequest, RunnerError> {
    Ok(ValidatedConfigRequest {
        output_prefix: output_prefix(&request.output, &policy.output_root)?,
        image: image(request.image.as_deref(), request.access_level, policy)?,
        dataset: request.dataset,
        access_level: request.access_level,
        cloud_environment: request.cloud_environment.unwrap_or(policy.default_environment),
        config: request.config.map(Value::Object),
    })
}

/// Workflows always run from a checked-out repository, with the driver image
pub fn normalize_cromwell(request: CromwellRequest, policy: &ValidationPolicy) -> Result<ValidatedWorkflow, RunnerError> {
    let output_prefix = output_prefix(&request.output, &policy.output_root)?;
    let commit = commit(Some(&request.repo), non_empty(Some(request.commit)))?
        .ok_or_else(|| RunnerError::validation("commit", "a commit is required"))?;
    let workflow = request.workflow.trim().to_string();
    if workflow.is_empty() {
        return Err(RunnerError::validation("workflow", "a workflow path is required"));
    }

    Ok(ValidatedWorkflow {
        dataset: request.dataset,
        output_prefix,
        access_level: request.access_level,
        cloud_environment: request.cloud_environment.unwrap_or(policy.default_environment),
        repo: request.repo,
        commit,
        branch: non_empty(request.branch),
        cwd: cwd(non_empty(request.cwd))?,
        description: request.description,
        workflow,
        input_json_paths: request.input_json_paths.unwrap_or_default(),
        inputs_dict: request.inputs_dict.map(Value::Object),
        dependencies: request.dependencies,
        labels: request.labels.unwrap_or_default(),
        image: policy.driver_image.clone(),
        config: request.config.map(Value::Object),
        wait: request.wait.unwrap_or(false),
    })
}

/// Check the output prefix is below a bucket root and strip trailing slashes
pub fn output_prefix(raw: &str, root: &str) -> Result<String, RunnerError> {
    let prefix = raw.trim().trim_end_matches('/');
    if !prefix.starts_with(root) {
        return Err(RunnerError::validation("output", format!("must start with \"{root}\"")));
    }
    if prefix.matches('/').count() <= 2 {
        return Err(RunnerError::validation("output", "must be a path inside a bucket, not the bucket root"));
    }
    Ok(prefix.to_string())
}

/// An empty script runs the default entry point; tokens are never reinterpreted
pub fn script(raw: Vec<String>) -> Vec<String> {
    if raw.is_empty() {
        vec![DEFAULT_SCRIPT.to_string()]
    } else {
        raw
    }
}

pub fn commit(repo: Option<&str>, commit: Option<String>) -> Result<Option<String>, RunnerError> {
    match (repo, commit) {
        (_, Some(commit)) if commit.eq_ignore_ascii_case("HEAD") => {
            Err(RunnerError::validation("commit", "\"HEAD\" is ambiguous, give a commit SHA"))
        }
        (Some(_), None) => Err(RunnerError::validation("commit", "a commit is required when a repo is given")),
        (None, Some(_)) => Err(RunnerError::validation("repo", "a repo is required when a commit is given")),
        (_, commit) => Ok(commit),
    }
}

/// Resolve the image, enforcing the registry allowlist above the test access level
pub fn image(raw: Option<&str>, level: AccessLevel, policy: &ValidationPolicy) -> Result<String, RunnerError> {
    let raw = raw.map(str::trim).filter(|image| !image.is_empty());
    match raw {
        None if level.is_test() => Ok(policy.driver_image.clone()),
        None => Err(RunnerError::validation("image", format!("an image is required at {level} access"))),
        Some(image) if level.is_test() => Ok(image.to_string()),
        Some(image) => {
            if policy.allowed_image_prefixes.iter().any(|prefix| image.starts_with(prefix.as_str())) {
                Ok(image.to_string())
            } else {
                Err(RunnerError::validation("image", format!("\"{image}\" is not from an allowed registry for {level} access")))
            }
        }
    }
}

/// Resource hints are a non-negative number with an optional unit, such as `2`, `0.5` or `8Gi`
pub fn resource(field: &str, value: Option<ResourceValue>) -> Result<Option<ResourceValue>, RunnerError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let text = value.to_string();
    if !is_quantity(&text) {
        return Err(RunnerError::validation(field, format!("\"{}\" is not a number with an optional unit", text.escape_debug())));
    }
    Ok(Some(value))
}

fn is_quantity(text: &str) -> bool {
    let unit_at = text.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(text.len());
    let (number, unit) = text.split_at(unit_at);
    let valid_number = match number.split_once('.') {
        None => !number.is_empty(),
        Some((whole, fraction)) => !whole.is_empty() && !fraction.is_empty() && !fraction.contains('.'),
    };
    valid_number && unit.chars().all(|c| c.is_ascii_alphabetic())
}

fn cwd(raw: Option<String>) -> Result<Option<String>, RunnerError> {
    let Some(cwd) = raw else {
        return Ok(None);
    };
    let path = Path::new(&cwd);
    let escapes = path.components().any(|component| matches!(component, Component::ParentDir));
    if path.is_absolute() || escapes {
        return Err(RunnerError::validation("cwd", "must be a relative path inside the repository"));
    }
    Ok(Some(cwd))
}

fn environment_variables(variables: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, RunnerError> {
    for name in variables.keys() {
        let upper = name.to_ascii_uppercase();
        let reserved = RESERVED_VARS.contains(&upper.as_str())
            || RESERVED_VAR_PREFIXES.iter().any(|prefix| upper.starts_with(prefix));
        if reserved {
            return Err(RunnerError::validation("environmentVariables", format!("{name} is reserved")));
        }
        let mut chars = name.chars();
        let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(RunnerError::validation("environmentVariables", format!("\"{name}\" is not a valid variable name")));
        }
    }
    Ok(variables)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}
