use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use log::{info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::email_from_headers;
use crate::cromwell::job::workflow_jobs;
use crate::error::RunnerError;
use crate::policy::AccessRequest;
use crate::recorder::ProvenanceRecord;
use crate::request::args::{generate_run_id, AuthorizedWorkflowArgs};
use crate::request::message::read_request;
use crate::request::schema::RequestKind;
use crate::request::submission::CromwellRequest;
use crate::request::validate::normalize_cromwell;
use crate::server::routes::{run_config, timestamp, ConfigArgs};
use crate::server::state::AppState;

/// `POST /cromwell`: dispatch the submit job and the watcher that waits on it
pub async fn submit_workflow(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Result<String, RunnerError> {
    let email = email_from_headers(&headers, &state.auth)?;
    let request: CromwellRequest = read_request(&state.schemas, RequestKind::Cromwell, &body)?;

    let dataset = state.authorize(&AccessRequest {
        dataset: &request.dataset,
        environment: request.cloud_environment.unwrap_or(state.validation.default_environment),
        email: &email,
        access_level: request.access_level,
        repo: Some(request.repo.trim()),
    }).await?;

    let workflow = normalize_cromwell(request, &state.validation)?;
    let args = AuthorizedWorkflowArgs::new(generate_run_id(), email, workflow, dataset);
    let workflow = &args.workflow;
    info!("Workflow run {} for {} on {}: {}", args.run_id, args.email, workflow.dataset, workflow.workflow);

    let config = run_config(&state, &ConfigArgs {
        run_id: &args.run_id,
        environment: workflow.cloud_environment,
        project: &args.gcp_project,
        dataset: &workflow.dataset,
        access_level: workflow.access_level,
        output_prefix: &workflow.output_prefix,
        image: &workflow.image,
        overlay: workflow.config.as_ref(),
    }).await?;
    let config_path = state.run_configs.write(&config, &args.run_id, workflow.cloud_environment).await?;

    let mut jobs = workflow_jobs(&args, &config_path, state.dispatcher.git(), &state.workflow_jobs);
    let submitted = state.dispatcher.submit(&args.run_id, &jobs.submit).await?;
    jobs.watch.depends_on.push(submitted.job_id.clone());
    let watcher = state.dispatcher.submit(&args.run_id, &jobs.watch).await?;

    let record = ProvenanceRecord {
        ar_guid: args.run_id.clone(),
        name: args.job_name(),
        timestamp: timestamp(),
        dataset: workflow.dataset.clone(),
        user: args.email.clone(),
        access_level: workflow.access_level.to_string(),
        repo: Some(workflow.repo.clone()),
        commit: Some(workflow.commit.clone()),
        script: workflow.workflow.clone(),
        description: workflow.description.clone(),
        output: workflow.output_prefix.clone(),
        driver_image: workflow.image.clone(),
        config_path: config_path.to_string(),
        cwd: workflow.cwd.clone(),
        environment: workflow.cloud_environment.to_string(),
        mode: Some("cromwell".to_string()),
    };
    state.recorder.record(&workflow.output_prefix, &record, &submitted.url).await;

    if workflow.wait {
        state.dispatcher.wait(&watcher).await?;
    }
    Ok(format!("{}\n", submitted.url))
}

/// `GET /cromwell/:workflow_id/metadata`, for any authenticated caller
pub async fn workflow_metadata(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, RunnerError> {
    let email = email_from_headers(&headers, &state.auth)?;
    let workflow_id = Uuid::parse_str(&workflow_id)
        .map_err(|_| RunnerError::validation("workflow_id", "must be a workflow UUID"))?
        .to_string();
    info!("{email} requested metadata of workflow {workflow_id}");
    let metadata = state.engine
        .metadata(&workflow_id)
        .await
        .inspect_err(|err| warn!("Metadata of workflow {workflow_id} unavailable: {err}"))?;
    Ok(Json(metadata))
}
