use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use crate::auth::AuthSettings;
use crate::cromwell::job::WorkflowJobSettings;
use crate::cromwell::{CromwellClient, WorkflowEngine};
use crate::db::{open_db, JobLedger};
use crate::dispatch::memory::MemoryBackend;
use crate::dispatch::{BatchBackend, Dispatcher};
use crate::error::RunnerError;
use crate::policy::membership::{BlobMembershipCache, MembershipCache};
use crate::policy::store::PolicyStore;
use crate::policy::{authorize, AccessRequest, AccessSettings, DatasetEnvConfig};
use crate::publish::{EventPublisher, LogPublisher, PubSubPublisher};
use crate::recorder::MetadataRecorder;
use crate::request::schema::RequestSchemas;
use crate::request::validate::ValidationPolicy;
use crate::run_config::RunConfigWriter;
use crate::settings::ServerSettings;
use crate::slurm::SlurmBackend;
use crate::token::{MetadataServerToken, TokenKind};

/// Everything a handler needs, built once at start-up and shared read-only
pub struct AppState {
    pub policy: Arc<PolicyStore>,
    pub membership: Arc<dyn MembershipCache>,
    pub schemas: RequestSchemas,
    pub auth: AuthSettings,
    pub access: AccessSettings,
    pub validation: ValidationPolicy,
    pub run_configs: RunConfigWriter,
    pub dispatcher: Dispatcher,
    pub recorder: MetadataRecorder,
    pub engine: Arc<dyn WorkflowEngine>,
    pub workflow_jobs: WorkflowJobSettings,
}

impl AppState {
    /// Connect every component named in the settings
    pub async fn from_settings(settings: &ServerSettings) -> Result<AppState> {
        let store = settings.storage.store()?;

        let policy = PolicyStore::load(settings.config_source(store.clone())?)
            .await
            .context("Can't load server config")?;
        let membership = BlobMembershipCache::new(store.clone(), settings.members_cache()?);

        let backend: Arc<dyn BatchBackend> = if settings.dry_run {
            info!("Dry run: jobs are accepted but never run");
            Arc::new(MemoryBackend::new())
        } else {
            std::fs::create_dir_all(&settings.slurm_work_dir)
                .with_context(|| format!("Can't create {}", settings.slurm_work_dir.display()))?;
            let conn = open_db(&settings.slurm_work_dir).context("Can't open the job ledger")?;
            Arc::new(SlurmBackend::new(settings.slurm(), JobLedger::new(conn)))
        };
        let dispatcher = Dispatcher::new(backend, settings.git(), Duration::from_secs(settings.wait_poll_secs));

        let publisher: Arc<dyn EventPublisher> = match &settings.pubsub_topic {
            Some(topic) => {
                let token = Arc::new(MetadataServerToken::new(TokenKind::Access));
                Arc::new(PubSubPublisher::new(&settings.pubsub_endpoint, topic, token).context("Can't set up publishing")?)
            }
            None => {
                info!("No topic configured, submission events are only logged");
                Arc::new(LogPublisher)
            }
        };

        let engine = CromwellClient::new(&settings.cromwell.cromwell_url, settings.cromwell.token(), settings.cromwell.timeout())
            .context("Can't set up the workflow engine client")?;

        Ok(AppState {
            policy: Arc::new(policy),
            membership: Arc::new(membership),
            schemas: RequestSchemas::load()?,
            auth: settings.auth(),
            access: settings.access(),
            validation: settings.validation(),
            run_configs: RunConfigWriter::new(store.clone(), settings.config_prefixes()?, settings.config_templates.clone()),
            dispatcher,
            recorder: MetadataRecorder::new(store, publisher, &settings.sidecar_name),
            engine: Arc::new(engine),
            workflow_jobs: settings.workflow_jobs(),
        })
    }

    /// Check the request against the current server config
    pub async fn authorize(&self, request: &AccessRequest<'_>) -> Result<DatasetEnvConfig, RunnerError> {
        let config = self.policy.current();
        authorize(&config, self.membership.as_ref(), &self.access, request).await
    }
}
