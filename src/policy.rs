//! Dataset access policy
//!
//! Decides whether a caller may run against a dataset at an access level, and resolves the
//! dataset's bindings for the requested cloud environment. The decision is recomputed for every
//! request; only the membership lists are cached, and by another process.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{info, warn};

use crate::error::RunnerError;
use crate::namespace::{AccessLevel, CloudEnvironment};

/// Dataset policy document and its wire format
pub mod server_config;
/// Cached group membership lookups
pub mod membership;
/// Current server config with explicit reload
pub mod store;

use membership::MembershipCache;
use server_config::ServerConfig;

#[derive(Clone, Debug)]
pub struct AccessSettings {
    /// Group address template, `{dataset}` and `{domain}` are substituted
    pub group_template: String,
    pub domain: String,
    pub lookup_timeout: Duration,
}

impl Default for AccessSettings {
    fn default() -> Self {
        AccessSettings {
            group_template: "{dataset}-access@{domain}".to_string(),
            domain: "populationgenomics.org.au".to_string(),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

impl AccessSettings {
    pub fn access_group(&self, dataset: &str) -> String {
        self.group_template
            .replace("{dataset}", dataset)
            .replace("{domain}", &self.domain)
    }
}

/// What is being asked for
#[derive(Clone, Copy, Debug)]
pub struct AccessRequest<'a> {
    pub dataset: &'a str,
    pub environment: CloudEnvironment,
    pub email: &'a str,
    pub access_level: AccessLevel,
    pub repo: Option<&'a str>,
}

/// Bindings of an authorized dataset in the requested environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetEnvConfig {
    pub project_id: Option<String>,
    /// Credential reference for the requested access level
    pub credential: String,
    pub allowed_repos: BTreeSet<String>,
}

/// Check a request against the dataset policy
///
/// Checks run in order and each has its own failure: unknown dataset, unsupported environment,
/// caller not in the dataset's access group, repository not allowed, access level not
/// provisioned. A membership lookup that fails or times out counts as "not a member".
pub async fn authorize(
    config: &ServerConfig,
    membership: &dyn MembershipCache,
    settings: &AccessSettings,
    request: &AccessRequest<'_>,
) -> Result<DatasetEnvConfig, RunnerError> {
    let dataset = config.datasets.get(request.dataset).ok_or_else(|| {
        RunnerError::Authorization(format!(
            "The dataset \"{}\" is not present in the server config", request.dataset
        ))
    })?;

    let environment = dataset.environment(request.environment).ok_or_else(|| {
        RunnerError::Authorization(format!(
            "Dataset \"{}\" does not support the {} environment", request.dataset, request.environment
        ))
    })?;

    let group = settings.access_group(request.dataset);
    if !is_member(membership, settings.lookup_timeout, &group, request.email).await {
        return Err(RunnerError::Authorization(format!(
            "{} is not a member of the {} access group", request.email, request.dataset
        )));
    }

    let allowed_repos = environment.allowed_repos.clone().unwrap_or_else(|| dataset.allowed_repos.clone());
    if let Some(repo) = request.repo {
        if !allowed_repos.contains(repo) {
            return Err(RunnerError::Authorization(format!(
                "Repository \"{}\" is not one of the allowed repositories for {}", repo, request.dataset
            )));
        }
    }

    let credential = environment.credential(request.access_level).ok_or_else(|| {
        RunnerError::Authorization(format!(
            "Access level \"{}\" is not available for {}", request.access_level, request.dataset
        ))
    })?;

    info!("Authorized {} for {} at {} access", request.email, request.dataset, request.access_level);
    Ok(DatasetEnvConfig {
        project_id: environment.project_id.clone(),
        credential: credential.to_string(),
        allowed_repos,
    })
}

async fn is_member(membership: &dyn MembershipCache, timeout: Duration, group: &str, email: &str) -> bool {
    match tokio::time::timeout(timeout, membership.is_member(group, email)).await {
        Ok(Ok(member)) => member,
        Ok(Err(err)) => {
            warn!("Membership lookup for {group} failed, treating {email} as non-member: {err}");
            false
        }
        Err(_) => {
            warn!("Membership lookup for {group} timed out, treating {email} as non-member");
            false
        }
    }
}
