use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Local;
use log::info;
use serde::Serialize;
use serde_json::Value;

use crate::auth::email_from_headers;
use crate::error::RunnerError;
use crate::namespace::{AccessLevel, CloudEnvironment};
use crate::policy::AccessRequest;
use crate::recorder::ProvenanceRecord;
use crate::request::args::{generate_run_id, AuthorizedJobArgs};
use crate::request::message::read_request;
use crate::request::schema::RequestKind;
use crate::request::submission::{ConfigRequest, SubmissionRequest};
use crate::request::validate::{normalize_config_request, normalize_submission};
use crate::run_config::{assemble, baseline, BaselineArgs, TemplateContext, PREVIEW_RUN_ID};
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Inputs of a run config, shared by every endpoint that builds one
pub(crate) struct ConfigArgs<'a> {
    pub run_id: &'a str,
    pub environment: CloudEnvironment,
    pub project: &'a str,
    pub dataset: &'a str,
    pub access_level: AccessLevel,
    pub output_prefix: &'a str,
    pub image: &'a str,
    pub overlay: Option<&'a Value>,
}

/// Baseline, template layers and the caller's overlay, in that order
pub(crate) async fn run_config(state: &AppState, args: &ConfigArgs<'_>) -> Result<Value, RunnerError> {
    let base = baseline(&BaselineArgs {
        run_id: args.run_id,
        environment: args.environment,
        project: args.project,
        dataset: args.dataset,
        access_level: args.access_level,
        output_prefix: args.output_prefix,
        driver_image: args.image,
    });
    let namespace = args.access_level.namespace().to_string();
    let templates = state.run_configs
        .load_templates(&TemplateContext { environment: args.environment, dataset: args.dataset, namespace: &namespace })
        .await?;
    Ok(assemble(base, &templates, args.overlay))
}

pub(crate) fn timestamp() -> String {
    Local::now().to_rfc3339()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

/// `POST /`: run a script from a repository, or an image's entrypoint
pub async fn submit(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Result<String, RunnerError> {
    let email = email_from_headers(&headers, &state.auth)?;
    let request: SubmissionRequest = read_request(&state.schemas, RequestKind::Submission, &body)?;

    let dataset = state.authorize(&AccessRequest {
        dataset: &request.dataset,
        environment: request.cloud_environment.unwrap_or(state.validation.default_environment),
        email: &email,
        access_level: request.access_level,
        repo: non_empty(&request.repo),
    }).await?;

    let submission = normalize_submission(request, &state.validation)?;
    let args = AuthorizedJobArgs::new(generate_run_id(), email, submission, dataset);
    let submission = &args.submission;
    info!("Run {} for {} on {} at {} access", args.run_id, args.email, submission.dataset, submission.access_level);

    let config = run_config(&state, &ConfigArgs {
        run_id: &args.run_id,
        environment: submission.cloud_environment,
        project: &args.gcp_project,
        dataset: &submission.dataset,
        access_level: submission.access_level,
        output_prefix: &submission.output_prefix,
        image: &submission.image,
        overlay: submission.config.as_ref(),
    }).await?;
    let config_path = state.run_configs.write(&config, &args.run_id, submission.cloud_environment).await?;

    let job = state.dispatcher.dispatch(&args, &config_path).await?;

    let record = ProvenanceRecord {
        ar_guid: args.run_id.clone(),
        name: args.job_name(),
        timestamp: timestamp(),
        dataset: submission.dataset.clone(),
        user: args.email.clone(),
        access_level: submission.access_level.to_string(),
        repo: submission.repo.clone(),
        commit: submission.commit.clone(),
        script: submission.script.join(" "),
        description: submission.description.clone(),
        output: submission.output_prefix.clone(),
        driver_image: submission.image.clone(),
        config_path: config_path.to_string(),
        cwd: submission.cwd.clone(),
        environment: submission.cloud_environment.to_string(),
        mode: None,
    };
    state.recorder.record(&submission.output_prefix, &record, &job.url).await;

    if submission.wait {
        state.dispatcher.wait(&job).await?;
    }
    Ok(format!("{}\n", job.url))
}

/// `POST /config`: the run config a submission would get, nothing is written or dispatched
pub async fn preview_config(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>, RunnerError> {
    let email = email_from_headers(&headers, &state.auth)?;
    let request: ConfigRequest = read_request(&state.schemas, RequestKind::Config, &body)?;

    let dataset = state.authorize(&AccessRequest {
        dataset: &request.dataset,
        environment: request.cloud_environment.unwrap_or(state.validation.default_environment),
        email: &email,
        access_level: request.access_level,
        repo: None,
    }).await?;

    let request = normalize_config_request(request, &state.validation)?;
    let project = dataset.project_id.unwrap_or_else(|| request.dataset.clone());
    let config = run_config(&state, &ConfigArgs {
        run_id: PREVIEW_RUN_ID,
        environment: request.cloud_environment,
        project: &project,
        dataset: &request.dataset,
        access_level: request.access_level,
        output_prefix: &request.output_prefix,
        image: &request.image,
        overlay: request.config.as_ref(),
    }).await?;
    Ok(Json(config))
}
