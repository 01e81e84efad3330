//! Steps run by the workflow worker inside batch jobs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde_json::{Map, Value};
use tokio::fs;

use crate::cromwell::client::WorkflowSubmission;

/// Files and inline values making up a submission, as given on the worker's command line
#[derive(Clone, Debug, Default)]
pub struct SubmissionFiles {
    pub workflow: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub inputs_dict: Option<String>,
    pub dependencies: Option<PathBuf>,
    pub labels: Option<String>,
    pub options: Option<String>,
    /// Key file whose contents become `user_service_account_json`
    pub service_account_file: Option<PathBuf>,
}

/// Merge input documents in order and the inline inputs last, later values win per key
pub fn merge_inputs(documents: &[Value], inline: Option<&Value>) -> Result<Value> {
    let mut merged = Map::new();
    for document in documents.iter().chain(inline) {
        let Value::Object(inputs) = document else {
            bail!("Workflow inputs must be JSON objects");
        };
        merged.extend(inputs.clone());
    }
    Ok(Value::Object(merged))
}

/// Read everything the submission refers to
pub async fn read_submission(files: &SubmissionFiles) -> Result<WorkflowSubmission> {
    let source = fs::read(&files.workflow)
        .await
        .with_context(|| format!("Can't read workflow {}", files.workflow.display()))?;
    let source_name = files.workflow
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow.wdl".to_string());

    let mut documents = Vec::with_capacity(files.inputs.len());
    for path in &files.inputs {
        documents.push(read_json(path).await?);
    }
    let inline = files.inputs_dict.as_deref().map(parse_json).transpose()?;
    let inputs = merge_inputs(&documents, inline.as_ref())?;

    let mut options = match files.options.as_deref() {
        Some(options) => parse_json(options)?,
        None => Value::Object(Map::new()),
    };
    if let Some(key_file) = &files.service_account_file {
        let key = fs::read_to_string(key_file)
            .await
            .with_context(|| format!("Can't read service account key {}", key_file.display()))?;
        let fields = options.as_object_mut().ok_or_else(|| anyhow!("Workflow options must be a JSON object"))?;
        fields.insert("user_service_account_json".to_string(), Value::String(key));
    }

    let labels: BTreeMap<String, String> = match files.labels.as_deref() {
        Some(labels) => serde_json::from_str(labels).context("Labels must be a JSON object of strings")?,
        None => BTreeMap::new(),
    };
    let dependencies = match &files.dependencies {
        Some(path) => Some(fs::read(path).await.with_context(|| format!("Can't read {}", path.display()))?),
        None => None,
    };

    Ok(WorkflowSubmission { source, source_name, inputs, options, labels, dependencies })
}

pub async fn write_handle(path: &Path, workflow_id: &str) -> Result<()> {
    fs::write(path, workflow_id)
        .await
        .with_context(|| format!("Can't write workflow handle {}", path.display()))?;
    info!("Workflow id {workflow_id} written to {}", path.display());
    Ok(())
}

pub async fn read_handle(path: &Path) -> Result<String> {
    let id = fs::read_to_string(path)
        .await
        .with_context(|| format!("Can't read workflow handle {}", path.display()))?;
    let id = id.trim();
    if id.is_empty() {
        bail!("Workflow handle {} is empty", path.display());
    }
    Ok(id.to_string())
}

async fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("Can't read inputs {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} isn't valid JSON", path.display()))
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).context("Invalid JSON argument")
}
