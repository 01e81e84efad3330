//! Command line and environment configuration
//!
//! Every flag can also be set through the environment variable named next to it, which is how the
//! server is configured when deployed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};

use crate::auth::AuthSettings;
use crate::cromwell::job::WorkflowJobSettings;
use crate::cromwell::{BackoffSettings, WatchSettings};
use crate::dispatch::GitSettings;
use crate::namespace::CloudEnvironment;
use crate::policy::store::ConfigSource;
use crate::policy::AccessSettings;
use crate::request::validate::ValidationPolicy;
use crate::slurm::SlurmSettings;
use crate::storage::{BlobStore, BlobUri, S3BlobStore};
use crate::token::{MetadataServerToken, StaticToken, TokenKind, TokenProvider};

/// Object storage connection, shared by the server and the worker
#[derive(Args, Clone, Debug)]
pub struct StorageArgs {
    /// S3 protocol endpoint, e.g. https://storage.googleapis.com
    #[arg(long, env = "STORAGE_ENDPOINT")]
    pub storage_endpoint: Option<String>,

    #[arg(long, env = "STORAGE_REGION", default_value = "auto")]
    pub storage_region: String,
}

impl StorageArgs {
    pub fn store(&self) -> Result<Arc<dyn BlobStore>> {
        let store = S3BlobStore::new(self.storage_endpoint.as_deref(), &self.storage_region)
            .context("Can't set up object storage")?;
        Ok(Arc::new(store))
    }
}

/// Workflow engine connection, shared by the server and the worker
#[derive(Args, Clone, Debug)]
pub struct CromwellArgs {
    #[arg(long, env = "CROMWELL_URL", default_value = "https://cromwell.populationgenomics.org.au")]
    pub cromwell_url: String,

    /// Audience of identity tokens for the engine, access tokens are used when unset
    #[arg(long, env = "CROMWELL_AUDIENCE")]
    pub cromwell_audience: Option<String>,

    /// Fixed bearer token for the engine, instead of asking the metadata server
    #[arg(long, env = "CROMWELL_TOKEN", hide_env_values = true)]
    pub cromwell_token: Option<String>,

    #[arg(long, env = "CROMWELL_TIMEOUT_SECS", default_value_t = 120)]
    pub cromwell_timeout_secs: u64,
}

impl CromwellArgs {
    pub fn token(&self) -> Arc<dyn TokenProvider> {
        match (&self.cromwell_token, &self.cromwell_audience) {
            (Some(token), _) => Arc::new(StaticToken(token.clone())),
            (None, Some(audience)) => Arc::new(MetadataServerToken::new(TokenKind::Identity { audience: audience.clone() })),
            (None, None) => Arc::new(MetadataServerToken::new(TokenKind::Access)),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.cromwell_timeout_secs)
    }
}

/// Backoff of the workflow watcher
#[derive(Args, Clone, Debug)]
pub struct BackoffArgs {
    #[arg(long, env = "WATCH_MIN_POLL_SECONDS", default_value_t = 5)]
    pub min_poll_seconds: u64,

    #[arg(long, env = "WATCH_MAX_POLL_SECONDS", default_value_t = 60)]
    pub max_poll_seconds: u64,

    /// Elapsed time after which polls happen every max-poll-seconds
    #[arg(long, env = "WATCH_HORIZON_SECONDS", default_value_t = 3600)]
    pub horizon_seconds: u64,

    /// Transient failures tolerated before the watch gives up
    #[arg(long, env = "WATCH_MAX_FAILURES", default_value_t = 10)]
    pub max_failures: u32,
}

impl BackoffArgs {
    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            backoff: BackoffSettings {
                min: Duration::from_secs(self.min_poll_seconds),
                max: Duration::from_secs(self.max_poll_seconds),
                horizon: Duration::from_secs(self.horizon_seconds),
            },
            max_failures: self.max_failures,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "analysis-runner")]
#[command(about = "Authorizes analysis submissions and dispatches them as batch jobs")]
#[command(version)]
pub struct ServerSettings {
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Dataset policy, a local path or a blob URI such as gs://bucket/server-config.json
    #[arg(long, env = "SERVER_CONFIG")]
    pub server_config: String,

    /// Seconds between server config reloads, SIGHUP also reloads
    #[arg(long, env = "SERVER_CONFIG_RELOAD_SECS", default_value_t = 600)]
    pub reload_interval_secs: u64,

    /// Location of the cached `{group}-members.txt` lists
    #[arg(long, env = "MEMBERS_CACHE_LOCATION")]
    pub members_cache_location: String,

    #[arg(long, env = "ACCESS_GROUP_DOMAIN", default_value = "populationgenomics.org.au")]
    pub access_group_domain: String,

    #[arg(long, env = "ACCESS_GROUP_TEMPLATE", default_value = "{dataset}-access@{domain}")]
    pub access_group_template: String,

    #[arg(long, env = "MEMBERSHIP_TIMEOUT_SECS", default_value_t = 5)]
    pub membership_timeout_secs: u64,

    /// Expected audience of caller identity tokens
    #[arg(long, env = "TOKEN_AUDIENCE")]
    pub token_audience: Option<String>,

    #[arg(long, env = "OUTPUT_ROOT", default_value = "gs://cpg-")]
    pub output_root: String,

    #[arg(
        long,
        env = "ALLOWED_IMAGE_PREFIXES",
        value_delimiter = ',',
        default_value = "australia-southeast1-docker.pkg.dev/analysis-runner/,australia-southeast1-docker.pkg.dev/cpg-common/images/"
    )]
    pub allowed_image_prefixes: Vec<String>,

    #[arg(long, env = "DRIVER_IMAGE", default_value = "australia-southeast1-docker.pkg.dev/analysis-runner/images/driver:latest")]
    pub driver_image: String,

    #[arg(long, env = "DEFAULT_CLOUD_ENVIRONMENT", value_enum, default_value_t = CloudEnvironment::Gcp)]
    pub default_environment: CloudEnvironment,

    /// Where run configs for GCP jobs are written
    #[arg(long, env = "GCP_CONFIG_PREFIX", default_value = "gs://cpg-config/config")]
    pub gcp_config_prefix: String,

    #[arg(long, env = "AZURE_CONFIG_PREFIX")]
    pub azure_config_prefix: Option<String>,

    /// Config template locations layered on every run config, in order
    #[arg(long, env = "CONFIG_TEMPLATES", value_delimiter = ',')]
    pub config_templates: Vec<String>,

    /// Provenance list kept below each output prefix
    #[arg(long, env = "METADATA_SIDECAR", default_value = "metadata.json")]
    pub sidecar_name: String,

    /// Pub/Sub topic (`projects/{project}/topics/{topic}`) for submission events, logged when unset
    #[arg(long, env = "PUBSUB_TOPIC")]
    pub pubsub_topic: Option<String>,

    #[arg(long, env = "PUBSUB_ENDPOINT", default_value = "https://pubsub.googleapis.com/v1")]
    pub pubsub_endpoint: String,

    #[arg(long, env = "GIT_REMOTE_TEMPLATE", default_value = "https://github.com/{org}/{repo}.git")]
    pub git_remote_template: String,

    #[arg(long, env = "GIT_WEB_TEMPLATE", default_value = "https://github.com/{org}/{repo}")]
    pub git_web_template: String,

    #[arg(long, env = "GIT_ORG", default_value = "populationgenomics")]
    pub git_org: String,

    #[arg(long, env = "GIT_DEFAULT_BRANCH", default_value = "main")]
    pub git_default_branch: String,

    /// Accept jobs without running them
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    #[arg(long, env = "SLURM_WORK_DIR", default_value = "/var/lib/analysis-runner")]
    pub slurm_work_dir: PathBuf,

    #[arg(long, env = "SLURM_PARTITION", default_value = "batch")]
    pub slurm_partition: String,

    #[arg(long, env = "SBATCH", default_value = "/usr/bin/sbatch")]
    pub sbatch: PathBuf,

    #[arg(long, env = "SACCT", default_value = "/usr/bin/sacct")]
    pub sacct: PathBuf,

    /// Base of tracking URLs handed back to callers
    #[arg(long, env = "TRACKING_URL", default_value = "http://localhost:8080")]
    pub tracking_url: String,

    /// Seconds between status polls of jobs submitted with `wait`
    #[arg(long, env = "WAIT_POLL_SECS", default_value_t = 30)]
    pub wait_poll_secs: u64,

    #[arg(long, env = "CROMWELL_WORKER", default_value = "analysis-runner-cromwell")]
    pub cromwell_worker: String,

    #[command(flatten)]
    pub cromwell: CromwellArgs,

    #[command(flatten)]
    pub backoff: BackoffArgs,

    #[command(flatten)]
    pub storage: StorageArgs,
}

impl ServerSettings {
    pub fn auth(&self) -> AuthSettings {
        AuthSettings { audience: self.token_audience.clone(), leeway_seconds: 60 }
    }

    pub fn access(&self) -> AccessSettings {
        AccessSettings {
            group_template: self.access_group_template.clone(),
            domain: self.access_group_domain.clone(),
            lookup_timeout: Duration::from_secs(self.membership_timeout_secs),
        }
    }

    pub fn validation(&self) -> ValidationPolicy {
        ValidationPolicy {
            output_root: self.output_root.clone(),
            allowed_image_prefixes: self.allowed_image_prefixes.clone(),
            driver_image: self.driver_image.clone(),
            default_environment: self.default_environment,
        }
    }

    pub fn git(&self) -> GitSettings {
        GitSettings {
            remote_template: self.git_remote_template.clone(),
            web_template: self.git_web_template.clone(),
            org: self.git_org.clone(),
            default_branch: self.git_default_branch.clone(),
        }
    }

    pub fn slurm(&self) -> SlurmSettings {
        SlurmSettings {
            work_dir: self.slurm_work_dir.clone(),
            partition: self.slurm_partition.clone(),
            sbatch: self.sbatch.clone(),
            sacct: self.sacct.clone(),
            tracking_url: self.tracking_url.clone(),
        }
    }

    pub fn workflow_jobs(&self) -> WorkflowJobSettings {
        WorkflowJobSettings {
            worker: self.cromwell_worker.clone(),
            cromwell_url: self.cromwell.cromwell_url.clone(),
            watch: self.backoff.watch_settings(),
            outputs_file: "cromwell-outputs.json".to_string(),
        }
    }

    pub fn config_prefixes(&self) -> Result<BTreeMap<CloudEnvironment, BlobUri>> {
        let mut prefixes = BTreeMap::new();
        prefixes.insert(CloudEnvironment::Gcp, BlobUri::parse(&self.gcp_config_prefix)?);
        if let Some(prefix) = &self.azure_config_prefix {
            prefixes.insert(CloudEnvironment::Azure, BlobUri::parse(prefix)?);
        }
        Ok(prefixes)
    }

    /// A `scheme://` location is read from object storage, anything else from disk
    pub fn config_source(&self, store: Arc<dyn BlobStore>) -> Result<ConfigSource> {
        if self.server_config.contains("://") {
            Ok(ConfigSource::Blob { store, uri: BlobUri::parse(&self.server_config)? })
        } else {
            Ok(ConfigSource::File(PathBuf::from(&self.server_config)))
        }
    }

    pub fn members_cache(&self) -> Result<BlobUri> {
        BlobUri::parse(&self.members_cache_location).context("Invalid members cache location")
    }
}
