use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::cromwell::watch::WatchSettings;
use crate::dispatch::git::{checkout_commands, quote, GitSettings};
use crate::dispatch::{JobCommand, JobSpec, CREDENTIALS_VAR, RUN_DIR_VAR};
use crate::request::args::AuthorizedWorkflowArgs;
use crate::request::validate::CONFIG_PATH_VAR;
use crate::storage::BlobUri;

/// How workflow jobs call the worker
#[derive(Clone, Debug)]
pub struct WorkflowJobSettings {
    /// Worker program, must be on the PATH of the driver image
    pub worker: String,
    pub cromwell_url: String,
    pub watch: WatchSettings,
    /// Written below the output prefix once the workflow succeeds
    pub outputs_file: String,
}

impl Default for WorkflowJobSettings {
    fn default() -> Self {
        WorkflowJobSettings {
            worker: "analysis-runner-cromwell".to_string(),
            cromwell_url: "https://cromwell.populationgenomics.org.au".to_string(),
            watch: WatchSettings::default(),
            outputs_file: "cromwell-outputs.json".to_string(),
        }
    }
}

/// The submit job, and the watcher that has to wait for it
#[derive(Clone, Debug)]
pub struct WorkflowJobs {
    pub submit: JobSpec,
    pub watch: JobSpec,
}

/// Workflow id handed from the submit job to the watcher, in the run's shared directory
pub fn handle_path() -> String {
    format!("\"${RUN_DIR_VAR}\"/workflow-id.txt")
}

/// Labels put on the workflow, the caller's first and then the ones that identify the run
pub fn workflow_labels(args: &AuthorizedWorkflowArgs) -> BTreeMap<String, String> {
    let mut labels = args.workflow.labels.clone();
    labels.insert("ar-guid".to_string(), args.run_id.clone());
    labels.insert("dataset".to_string(), args.workflow.dataset.clone());
    labels
}

/// Engine options, without the service account key which the worker adds inside the job
pub fn workflow_options(args: &AuthorizedWorkflowArgs) -> Value {
    let workflow = &args.workflow;
    let namespace = workflow.access_level.namespace();
    json!({
        "google_project": args.gcp_project,
        "jes_gcs_root": format!("gs://cpg-{}-{}-tmp/cromwell", workflow.dataset, namespace),
        "final_workflow_outputs_dir": workflow.output_prefix,
        "google_labels": workflow_labels(args),
    })
}

/// Build the submit and watch jobs for a workflow
///
/// The watch job's dependency on the submit job is filled in once the submit job has an id.
pub fn workflow_jobs(args: &AuthorizedWorkflowArgs, config_path: &BlobUri, git: &GitSettings, settings: &WorkflowJobSettings) -> WorkflowJobs {
    let workflow = &args.workflow;
    let handle = handle_path();

    let mut lines = vec!["set -ex".to_string()];
    if let Some(branch) = &workflow.branch {
        lines.push(format!("echo {}", quote(&format!("BRANCH: {branch}"))));
    }
    let url = git.script_url(&workflow.repo, &workflow.commit, workflow.cwd.as_deref(), &workflow.workflow);
    lines.push(format!("echo {}", quote(&format!("URL: {url}"))));
    lines.push(format!("gcloud -q auth activate-service-account --key-file=\"${CREDENTIALS_VAR}\""));
    lines.extend(checkout_commands(&workflow.repo, &workflow.commit, !workflow.access_level.is_test(), git));
    if let Some(cwd) = &workflow.cwd {
        lines.push(format!("cd {}", quote(cwd)));
    }

    let mut submit = vec![
        quote(&settings.worker),
        "submit".to_string(),
        "--cromwell-url".to_string(),
        quote(&settings.cromwell_url),
        "--workflow".to_string(),
        quote(&workflow.workflow),
    ];
    for path in &workflow.input_json_paths {
        submit.push("--inputs".to_string());
        submit.push(quote(path));
    }
    if let Some(inputs) = &workflow.inputs_dict {
        submit.push("--inputs-dict".to_string());
        submit.push(quote(&inputs.to_string()));
    }
    if !workflow.dependencies.is_empty() {
        let mut zip = vec!["zip".to_string(), "-r".to_string(), "tools.zip".to_string()];
        zip.extend(workflow.dependencies.iter().map(|dependency| quote(dependency)));
        lines.push(zip.join(" "));
        submit.push("--dependencies".to_string());
        submit.push("tools.zip".to_string());
    }
    submit.extend([
        "--labels".to_string(),
        quote(&json!(workflow_labels(args)).to_string()),
        "--options".to_string(),
        quote(&workflow_options(args).to_string()),
        "--service-account-file".to_string(),
        format!("\"${CREDENTIALS_VAR}\""),
        "--handle".to_string(),
        handle.clone(),
    ]);
    lines.push(submit.join(" "));

    let output = BlobUri::parse(&workflow.output_prefix)
        .map(|prefix| prefix.join(&settings.outputs_file).to_string())
        .unwrap_or_else(|_| format!("{}/{}", workflow.output_prefix, settings.outputs_file));
    let backoff = &settings.watch.backoff;
    let watch = [
        quote(&settings.worker),
        "watch".to_string(),
        "--cromwell-url".to_string(),
        quote(&settings.cromwell_url),
        "--handle".to_string(),
        handle,
        "--output".to_string(),
        quote(&output),
        "--min-poll-seconds".to_string(),
        backoff.min.as_secs().to_string(),
        "--max-poll-seconds".to_string(),
        backoff.max.as_secs().to_string(),
        "--horizon-seconds".to_string(),
        backoff.horizon.as_secs().to_string(),
        "--max-failures".to_string(),
        settings.watch.max_failures.to_string(),
    ].join(" ");

    let env = vec![
        (CONFIG_PATH_VAR.to_string(), config_path.to_string()),
        (CREDENTIALS_VAR.to_string(), args.credential.clone()),
    ];
    let name = args.job_name();

    let mut submit_job = JobSpec::new(format!("{name} submit"), workflow.image.clone(), JobCommand::Script(lines));
    submit_job.env = env.clone();
    submit_job.attributes = args.attributes();

    let mut watch_job = JobSpec::new(format!("{name} watch"), workflow.image.clone(), JobCommand::Script(vec!["set -ex".to_string(), watch]));
    watch_job.env = env;
    watch_job.attributes = args.attributes();

    WorkflowJobs { submit: submit_job, watch: watch_job }
}
