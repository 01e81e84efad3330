use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

use analysis_runner::auth::AuthSettings;
use analysis_runner::cromwell::job::WorkflowJobSettings;
use analysis_runner::cromwell::{CromwellError, WorkflowEngine, WorkflowStatus};
use analysis_runner::dispatch::memory::MemoryBackend;
use analysis_runner::dispatch::{Dispatcher, GitSettings, JobCommand, JobSpec, JobStatus};
use analysis_runner::namespace::CloudEnvironment;
use analysis_runner::policy::membership::{MembershipCache, MembershipError, StaticMembership};
use analysis_runner::policy::server_config::ServerConfig;
use analysis_runner::policy::store::PolicyStore;
use analysis_runner::policy::AccessSettings;
use analysis_runner::publish::MemoryPublisher;
use analysis_runner::recorder::MetadataRecorder;
use analysis_runner::request::schema::RequestSchemas;
use analysis_runner::request::validate::ValidationPolicy;
use analysis_runner::run_config::RunConfigWriter;
use analysis_runner::server::{router, AppState};
use analysis_runner::storage::{BlobStore, BlobUri, MemoryBlobStore};

const WORKFLOW_ID: &str = "2f0b5a9c-6d3e-4f7a-9b1c-0e8d7f6a5b4c";
const UNKNOWN_WORKFLOW_ID: &str = "00000000-0000-4000-8000-000000000000";

const DRIVER_IMAGE: &str = "australia-southeast1-docker.pkg.dev/analysis-runner/images/driver:1.0";

struct FixedEngine;

#[async_trait]
impl WorkflowEngine for FixedEngine {
    async fn status(&self, _workflow_id: &str) -> Result<WorkflowStatus, CromwellError> {
        Ok(WorkflowStatus::Running)
    }

    async fn outputs(&self, _workflow_id: &str) -> Result<Value, CromwellError> {
        Ok(json!({}))
    }

    async fn metadata(&self, workflow_id: &str) -> Result<Value, CromwellError> {
        if workflow_id == UNKNOWN_WORKFLOW_ID {
            return Err(CromwellError::Status { status: 404, body: "Unrecognized workflow ID".to_string() });
        }
        Ok(json!({"id": workflow_id, "status": "Running"}))
    }
}

struct UnavailableMembership;

#[async_trait]
impl MembershipCache for UnavailableMembership {
    async fn is_member(&self, _group: &str, _email: &str) -> Result<bool, MembershipError> {
        Err(MembershipError::Timeout)
    }
}

struct TestServer {
    app: Router,
    store: Arc<MemoryBlobStore>,
    backend: Arc<MemoryBackend>,
    publisher: Arc<MemoryPublisher>,
}

fn server_config() -> ServerConfig {
    serde_json::from_value(json!({
        "fewgenomes": {
            "allowedRepos": ["fewgenomes", "sample-metadata"],
            "gcp": {
                "projectId": "fewgenomes-1234",
                "testToken": "/secrets/fewgenomes-test.json",
                "standardToken": "/secrets/fewgenomes-standard.json",
                "fullToken": "/secrets/fewgenomes-full.json"
            }
        },
        "tob-wgs": {
            "gcp": {"testToken": "/secrets/tob-wgs-test.json"}
        }
    })).unwrap()
}

async fn test_server_with(membership: Arc<dyn MembershipCache>, backend: MemoryBackend) -> TestServer {
    let store = Arc::new(MemoryBlobStore::new());
    let template = BlobUri::parse("gs://cpg-config/templates/gcp.toml").unwrap();
    store.put(&template, b"[hail]\ndataproc_region = \"australia-southeast1\"\n".to_vec(), "application/toml").await.unwrap();

    let backend = Arc::new(backend);
    let publisher = Arc::new(MemoryPublisher::new());
    let prefixes = BTreeMap::from([(CloudEnvironment::Gcp, BlobUri::parse("gs://cpg-config/config").unwrap())]);
    let blob_store: Arc<dyn BlobStore> = store.clone();

    let state = AppState {
        policy: Arc::new(PolicyStore::fixed(server_config())),
        membership,
        schemas: RequestSchemas::load().unwrap(),
        auth: AuthSettings::default(),
        access: AccessSettings::default(),
        validation: ValidationPolicy {
            output_root: "gs://cpg-".to_string(),
            allowed_image_prefixes: vec!["australia-southeast1-docker.pkg.dev/analysis-runner/".to_string()],
            driver_image: DRIVER_IMAGE.to_string(),
            default_environment: CloudEnvironment::Gcp,
        },
        run_configs: RunConfigWriter::new(blob_store.clone(), prefixes, vec!["gs://cpg-config/templates/{environment}.toml".to_string()]),
        dispatcher: Dispatcher::new(backend.clone(), GitSettings::default(), std::time::Duration::from_millis(10)),
        recorder: MetadataRecorder::new(blob_store, publisher.clone(), "metadata.json"),
        engine: Arc::new(FixedEngine),
        workflow_jobs: WorkflowJobSettings::default(),
    };

    TestServer { app: router(Arc::new(state)), store, backend, publisher }
}

async fn test_server() -> TestServer {
    let membership = StaticMembership::new()
        .with_member("fewgenomes-access@populationgenomics.org.au", "alice@populationgenomics.org.au")
        .with_member("tob-wgs-access@populationgenomics.org.au", "alice@populationgenomics.org.au");
    test_server_with(Arc::new(membership), MemoryBackend::new()).await
}

fn bearer(email: &str) -> String {
    let claims = json!({"email": email, "exp": chrono::Utc::now().timestamp() + 3600});
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"unchecked")).unwrap();
    format!("Bearer {token}")
}

fn post(uri: &str, body: &Value, email: Option<&str>) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(email) = email {
        request = request.header("authorization", bearer(email));
    }
    request.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn submission(level: &str) -> Value {
    json!({
        "dataset": "fewgenomes",
        "output": "gs://cpg-fewgenomes-test/qc",
        "accessLevel": level,
        "repo": "fewgenomes",
        "commit": "abc123",
        "script": ["qc.py", "--samples", "10"],
        "description": "sample qc",
    })
}

const ALICE: &str = "alice@populationgenomics.org.au";

fn script(job: &JobSpec) -> Vec<String> {
    match &job.command {
        JobCommand::Script(lines) => lines.clone(),
        JobCommand::Entrypoint(args) => panic!("expected a script, got entrypoint {args:?}"),
    }
}

#[tokio::test]
async fn health_is_ok() {
    let server = test_server().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&server.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"status": "ok"}));
}

#[tokio::test]
async fn test_level_submission_skips_ancestry_check() {
    let server = test_server().await;
    let (status, body) = send(&server.app, post("/", &submission("test"), Some(ALICE))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body.starts_with("memory://") && body.ends_with("/jobs/1\n"), "{body}");

    let jobs = server.backend.jobs().await;
    assert_eq!(jobs.len(), 1);
    let (run_id, job) = &jobs[0];
    assert_eq!(job.image, DRIVER_IMAGE);
    assert_eq!(job.env_value("GOOGLE_APPLICATION_CREDENTIALS"), Some("/secrets/fewgenomes-test.json"));
    let lines = script(job);
    assert!(lines.iter().all(|line| !line.contains("merge-base")));
    assert_eq!(lines.last().unwrap(), "qc.py --samples 10");

    let config_path = format!("gs://cpg-config/config/{run_id}.toml");
    assert_eq!(job.env_value("CPG_CONFIG_PATH"), Some(config_path.as_str()));
    let config = server.store.get(&BlobUri::parse(&config_path).unwrap()).await.unwrap().unwrap();
    let config: toml::Value = toml::from_str(std::str::from_utf8(&config).unwrap()).unwrap();
    assert_eq!(config["workflow"]["ar_guid"].as_str(), Some(run_id.as_str()));
    assert_eq!(config["workflow"]["dataset_gcp_project"].as_str(), Some("fewgenomes-1234"));
    assert_eq!(config["hail"]["dataproc_region"].as_str(), Some("australia-southeast1"));
}

#[tokio::test]
async fn full_level_submission_gates_on_ancestry() {
    let server = test_server().await;
    let mut body = submission("full");
    body["image"] = json!(DRIVER_IMAGE);
    let (status, text) = send(&server.app, post("/", &body, Some(ALICE))).await;
    assert_eq!(status, StatusCode::OK, "{text}");

    let (_, job) = &server.backend.jobs().await[0];
    let lines = script(job);
    let gate = lines.iter().position(|line| line.contains("merge-base --is-ancestor abc123")).unwrap();
    let run = lines.iter().position(|line| line.starts_with("qc.py")).unwrap();
    assert!(gate < run);
    assert_eq!(job.env_value("GOOGLE_APPLICATION_CREDENTIALS"), Some("/secrets/fewgenomes-full.json"));
}

#[tokio::test]
async fn submission_records_provenance_and_publishes() {
    let server = test_server().await;
    let (status, url) = send(&server.app, post("/", &submission("test"), Some(ALICE))).await;
    assert_eq!(status, StatusCode::OK);

    let sidecar = BlobUri::parse("gs://cpg-fewgenomes-test/qc/metadata.json").unwrap();
    let records: Vec<Value> = serde_json::from_slice(&server.store.get(&sidecar).await.unwrap().unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["user"], ALICE);
    assert_eq!(records[0]["accessLevel"], "test");
    assert_eq!(records[0]["script"], "qc.py --samples 10");

    let events = server.publisher.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["batch_url"], url.trim_end());
    assert_eq!(events[0]["ar-guid"], records[0]["ar-guid"]);
}

#[tokio::test]
async fn missing_credential_is_unauthorized() {
    let server = test_server().await;
    let (status, body) = send(&server.app, post("/", &submission("test"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("authentication"));
    assert!(server.backend.jobs().await.is_empty());
}

#[tokio::test]
async fn non_member_is_forbidden() {
    let server = test_server().await;
    let (status, body) = send(&server.app, post("/", &submission("test"), Some("mallory@example.org"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("not a member"));
    assert!(server.backend.jobs().await.is_empty());
}

#[tokio::test]
async fn unknown_dataset_and_disallowed_repo_are_forbidden() {
    let server = test_server().await;

    let mut unknown = submission("test");
    unknown["dataset"] = json!("not-a-dataset");
    let (status, _) = send(&server.app, post("/", &unknown, Some(ALICE))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let mut repo = submission("test");
    repo["repo"] = json!("someone-elses-repo");
    let (status, body) = send(&server.app, post("/", &repo, Some(ALICE))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("someone-elses-repo"));
}

#[tokio::test]
async fn unprovisioned_access_level_is_forbidden() {
    let server = test_server().await;
    let body = json!({
        "dataset": "tob-wgs",
        "output": "gs://cpg-tob-wgs-main/qc",
        "accessLevel": "standard",
        "image": DRIVER_IMAGE,
        "description": "qc",
    });
    let (status, _) = send(&server.app, post("/", &body, Some(ALICE))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn membership_outage_is_forbidden() {
    let server = test_server_with(Arc::new(UnavailableMembership), MemoryBackend::new()).await;
    let (status, _) = send(&server.app, post("/", &submission("test"), Some(ALICE))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(server.backend.jobs().await.is_empty());
}

#[tokio::test]
async fn invalid_fields_are_bad_requests_naming_the_field() {
    let server = test_server().await;

    let mut head = submission("test");
    head["commit"] = json!("HEAD");
    let (status, body) = send(&server.app, post("/", &head, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("commit"), "{body}");

    let mut root = submission("test");
    root["output"] = json!("gs://cpg-fewgenomes-test");
    let (status, body) = send(&server.app, post("/", &root, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("output"), "{body}");

    let mut missing = submission("test");
    missing.as_object_mut().unwrap().remove("description");
    let (status, _) = send(&server.app, post("/", &missing, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut image = submission("standard");
    image["image"] = json!("docker.io/library/ubuntu");
    let (status, body) = send(&server.app, post("/", &image, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("image"), "{body}");

    assert!(server.backend.jobs().await.is_empty());
}

#[tokio::test]
async fn rejected_job_is_bad_gateway() {
    let membership = StaticMembership::new()
        .with_member("fewgenomes-access@populationgenomics.org.au", ALICE);
    let server = test_server_with(Arc::new(membership), MemoryBackend::rejecting("partition down")).await;
    let (status, body) = send(&server.app, post("/", &submission("test"), Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("partition down"));
}

#[tokio::test]
async fn config_overlays_do_not_leak_between_requests() {
    let server = test_server().await;
    let request = |x: i64| json!({
        "dataset": "fewgenomes",
        "output": "gs://cpg-fewgenomes-test/qc",
        "accessLevel": "test",
        "config": {"x": x, "workflow": {"sequencing_type": "genome"}},
    });

    let (status, first) = send(&server.app, post("/config", &request(1), Some(ALICE))).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    let (_, second) = send(&server.app, post("/config", &request(2), Some(ALICE))).await;
    let first: Value = serde_json::from_str(&first).unwrap();
    let second: Value = serde_json::from_str(&second).unwrap();

    assert_eq!(first["x"], 1);
    assert_eq!(second["x"], 2);
    assert_eq!(first["workflow"]["sequencing_type"], "genome");
    assert_eq!(first["workflow"]["dataset"], "fewgenomes");
    assert_eq!(first["workflow"]["ar_guid"], "<generated-at-runtime>");
    assert_eq!(first["hail"]["dataproc_region"], "australia-southeast1");

    assert!(server.backend.jobs().await.is_empty());
    assert!(server.store.uris().await.iter().all(|uri| !uri.to_string().starts_with("gs://cpg-config/config/")));
}

#[tokio::test]
async fn cromwell_submission_dispatches_submit_and_watch_jobs() {
    let server = test_server().await;
    let body = json!({
        "dataset": "fewgenomes",
        "output": "gs://cpg-fewgenomes-test/joint-calling",
        "accessLevel": "test",
        "repo": "fewgenomes",
        "commit": "abc123",
        "description": "joint calling",
        "workflow": "wdl/joint.wdl",
        "input_json_paths": ["wdl/inputs.json"],
        "dependencies": ["wdl/tasks"],
    });
    let (status, url) = send(&server.app, post("/cromwell", &body, Some(ALICE))).await;
    assert_eq!(status, StatusCode::OK, "{url}");
    assert!(url.ends_with("/jobs/1\n"));

    let jobs = server.backend.jobs().await;
    assert_eq!(jobs.len(), 2);
    let (_, submit) = &jobs[0];
    let (_, watch) = &jobs[1];
    assert!(script(submit).last().unwrap().contains(" submit "));
    assert_eq!(watch.depends_on, vec!["1".to_string()]);
    assert!(script(watch).last().unwrap().contains("cromwell-outputs.json"));

    let sidecar = BlobUri::parse("gs://cpg-fewgenomes-test/joint-calling/metadata.json").unwrap();
    let records: Vec<Value> = serde_json::from_slice(&server.store.get(&sidecar).await.unwrap().unwrap()).unwrap();
    assert_eq!(records[0]["mode"], "cromwell");
}

#[tokio::test]
async fn workflow_metadata_is_proxied() {
    let server = test_server().await;
    let request = |id: &str, email: Option<&str>| {
        let mut request = Request::builder().uri(format!("/cromwell/{id}/metadata"));
        if let Some(email) = email {
            request = request.header("authorization", bearer(email));
        }
        request.body(Body::empty()).unwrap()
    };

    let (status, body) = send(&server.app, request(WORKFLOW_ID, Some(ALICE))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["id"], WORKFLOW_ID);

    let (status, _) = send(&server.app, request(WORKFLOW_ID, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&server.app, request(UNKNOWN_WORKFLOW_ID, Some(ALICE))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("workflow"));

    let (status, body) = send(&server.app, request("..%2F..%2Fbackends", Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("workflow_id"), "{body}");
}

#[tokio::test]
async fn failed_job_with_wait_is_bad_gateway() {
    let membership = StaticMembership::new()
        .with_member("fewgenomes-access@populationgenomics.org.au", ALICE);
    let backend = MemoryBackend::finishing_with(JobStatus::Failed("OUT_OF_MEMORY".to_string()));
    let server = test_server_with(Arc::new(membership), backend).await;

    let mut body = submission("test");
    body["wait"] = json!(true);
    let (status, text) = send(&server.app, post("/", &body, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(text.contains("OUT_OF_MEMORY"), "{text}");

    // the run was accepted, so it is still on record
    let sidecar = BlobUri::parse("gs://cpg-fewgenomes-test/qc/metadata.json").unwrap();
    assert!(server.store.get(&sidecar).await.unwrap().is_some());
}

#[tokio::test]
async fn malformed_bearer_token_is_forbidden() {
    let server = test_server().await;
    for header in ["Bearer not-a-jwt", "Basic YWxpY2U6c2VjcmV0"] {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .header("authorization", header)
            .body(Body::from(submission("test").to_string()))
            .unwrap();
        let (status, _) = send(&server.app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{header}");
    }
    assert!(server.backend.jobs().await.is_empty());
}

#[tokio::test]
async fn repo_without_commit_is_bad_request() {
    let server = test_server().await;
    let mut body = submission("test");
    body.as_object_mut().unwrap().remove("commit");
    let (status, text) = send(&server.app, post("/", &body, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(text.contains("commit"), "{text}");
    assert!(server.backend.jobs().await.is_empty());
}

#[tokio::test]
async fn config_for_unknown_dataset_is_forbidden() {
    let server = test_server().await;
    let body = json!({
        "dataset": "not-a-dataset",
        "output": "gs://cpg-not-a-dataset-test/qc",
        "accessLevel": "test",
    });
    let (status, _) = send(&server.app, post("/config", &body, Some(ALICE))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn host_level_variables_and_multi_line_resources_are_bad_requests() {
    let server = test_server().await;

    let mut env = submission("test");
    env["environmentVariables"] = json!({"GOOGLE_APPLICATION_CREDENTIALS": "/secrets/fewgenomes-full.json"});
    let (status, body) = send(&server.app, post("/", &env, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("environmentVariables"), "{body}");

    let mut memory = submission("test");
    memory["memory"] = json!("8G\ntouch /tmp/outside");
    let (status, body) = send(&server.app, post("/", &memory, Some(ALICE))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("memory"), "{body}");

    assert!(server.backend.jobs().await.is_empty());
}
