use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::namespace::{AccessLevel, CloudEnvironment};

/// Dataset policy, keyed by dataset name
///
/// Loaded from a trusted location and never mutated; a reload builds a new value.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct ServerConfig {
    pub datasets: BTreeMap<String, DatasetPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetPolicy {
    #[serde(default)]
    pub allowed_repos: BTreeSet<String>,
    pub gcp: Option<EnvironmentPolicy>,
    pub azure: Option<EnvironmentPolicy>,
}

impl DatasetPolicy {
    pub fn environment(&self, environment: CloudEnvironment) -> Option<&EnvironmentPolicy> {
        match environment {
            CloudEnvironment::Gcp => self.gcp.as_ref(),
            CloudEnvironment::Azure => self.azure.as_ref(),
        }
    }
}

/// Bindings of a dataset in one cloud environment
///
/// Tokens are references (key file paths or secret handles) that are handed to the job, the
/// server never reads them.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPolicy {
    pub project_id: Option<String>,
    pub test_token: Option<String>,
    pub standard_token: Option<String>,
    pub full_token: Option<String>,
    /// Replaces the dataset-wide list when present
    pub allowed_repos: Option<BTreeSet<String>>,
}

impl EnvironmentPolicy {
    pub fn credential(&self, level: AccessLevel) -> Option<&str> {
        let token = match level {
            AccessLevel::Test => &self.test_token,
            AccessLevel::Standard => &self.standard_token,
            AccessLevel::Full => &self.full_token,
        };
        token.as_deref().filter(|token| !token.is_empty())
    }
}
