use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;

use crate::cromwell::watch::{WorkflowEngine, WorkflowStatus};
use crate::error::RunnerError;
use crate::token::TokenProvider;

#[derive(Debug, thiserror::Error)]
pub enum CromwellError {
    #[error("can't get a token for the workflow engine: {0}")]
    Token(String),
    #[error("workflow engine request failed: {0}")]
    Http(String),
    #[error("workflow engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected workflow engine response: {0}")]
    Decode(String),
}

impl From<CromwellError> for RunnerError {
    fn from(err: CromwellError) -> Self {
        RunnerError::Workflow(err.to_string())
    }
}

/// Everything posted to start a workflow
#[derive(Clone, Debug, Default)]
pub struct WorkflowSubmission {
    pub source: Vec<u8>,
    pub source_name: String,
    pub inputs: Value,
    pub options: Value,
    pub labels: BTreeMap<String, String>,
    /// Zip of import directories
    pub dependencies: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct StatusResponse {
    id: String,
    status: String,
}

#[derive(Deserialize)]
struct OutputsResponse {
    outputs: Value,
}

/// Client for the workflow engine's REST API
pub struct CromwellClient {
    http: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
}

impl CromwellClient {
    /// `timeout` bounds every call, metadata for big workflows can take minutes
    pub fn new(base_url: &str, token: Arc<dyn TokenProvider>, timeout: Duration) -> Result<CromwellClient, CromwellError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CromwellError::Http(err.to_string()))?;
        Ok(CromwellClient { http, base_url: base_url.trim_end_matches('/').to_string(), token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/workflows/v1{}", self.base_url, path)
    }

    async fn bearer(&self) -> Result<String, CromwellError> {
        self.token.token().await.map_err(|err| CromwellError::Token(err.to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, CromwellError> {
        let response = request
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(|err| CromwellError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CromwellError::Status { status: status.as_u16(), body });
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, CromwellError> {
        self.send(self.http.get(self.url(path)).query(query))
            .await?
            .json::<T>()
            .await
            .map_err(|err| CromwellError::Decode(err.to_string()))
    }

    /// Start a workflow and return its id
    pub async fn submit(&self, submission: WorkflowSubmission) -> Result<String, CromwellError> {
        let labels = serde_json::to_string(&submission.labels).map_err(|err| CromwellError::Decode(err.to_string()))?;
        let mut form = Form::new()
            .part("workflowSource", Part::bytes(submission.source).file_name(submission.source_name))
            .text("workflowInputs", submission.inputs.to_string())
            .text("workflowOptions", submission.options.to_string())
            .text("labels", labels);
        if let Some(dependencies) = submission.dependencies {
            form = form.part("workflowDependencies", Part::bytes(dependencies).file_name("tools.zip"));
        }

        let response: StatusResponse = self.send(self.http.post(self.url("")).multipart(form))
            .await?
            .json()
            .await
            .map_err(|err| CromwellError::Decode(err.to_string()))?;
        info!("Submitted workflow {} ({})", response.id, response.status);
        Ok(response.id)
    }

    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus, CromwellError> {
        let response: StatusResponse = self.get_json(&format!("/{workflow_id}/status"), &[]).await?;
        Ok(WorkflowStatus::parse(&response.status))
    }

    pub async fn outputs(&self, workflow_id: &str) -> Result<Value, CromwellError> {
        let response: OutputsResponse = self.get_json(&format!("/{workflow_id}/outputs"), &[]).await?;
        Ok(response.outputs)
    }

    /// Full metadata, sub-workflows expanded
    pub async fn metadata(&self, workflow_id: &str) -> Result<Value, CromwellError> {
        self.get_json(&format!("/{workflow_id}/metadata"), &[("expandSubWorkflows", "true")]).await
    }
}

#[async_trait::async_trait]
impl WorkflowEngine for CromwellClient {
    async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus, CromwellError> {
        CromwellClient::status(self, workflow_id).await
    }

    async fn outputs(&self, workflow_id: &str) -> Result<Value, CromwellError> {
        CromwellClient::outputs(self, workflow_id).await
    }

    async fn metadata(&self, workflow_id: &str) -> Result<Value, CromwellError> {
        CromwellClient::metadata(self, workflow_id).await
    }
}
