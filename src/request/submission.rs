use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::namespace::{AccessLevel, CloudEnvironment};

/// Body of `POST /`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub dataset: String,
    #[serde(alias = "outputPrefix")]
    pub output: String,
    pub access_level: AccessLevel,
    #[serde(default, alias = "cloud_environment")]
    pub cloud_environment: Option<CloudEnvironment>,
    pub repo: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub cwd: Option<String>,
    pub script: Option<Vec<String>>,
    pub description: String,
    pub image: Option<String>,
    pub cpu: Option<ResourceValue>,
    pub memory: Option<ResourceValue>,
    pub storage: Option<ResourceValue>,
    pub preemptible: Option<bool>,
    pub environment_variables: Option<BTreeMap<String, String>>,
    pub config: Option<Map<String, Value>>,
    pub wait: Option<bool>,
}

/// Body of `POST /config`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub dataset: String,
    #[serde(alias = "outputPrefix")]
    pub output: String,
    pub access_level: AccessLevel,
    #[serde(default, alias = "cloud_environment")]
    pub cloud_environment: Option<CloudEnvironment>,
    pub image: Option<String>,
    pub config: Option<Map<String, Value>>,
}

/// Body of `POST /cromwell`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CromwellRequest {
    pub dataset: String,
    #[serde(alias = "outputPrefix")]
    pub output: String,
    pub access_level: AccessLevel,
    #[serde(default, alias = "cloud_environment")]
    pub cloud_environment: Option<CloudEnvironment>,
    pub repo: String,
    pub commit: String,
    pub branch: Option<String>,
    pub cwd: Option<String>,
    pub description: String,
    pub workflow: String,
    #[serde(rename = "input_json_paths", alias = "inputs")]
    pub input_json_paths: Option<Vec<String>>,
    #[serde(rename = "inputs_dict")]
    pub inputs_dict: Option<Map<String, Value>>,
    pub dependencies: Vec<String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub config: Option<Map<String, Value>>,
    pub wait: Option<bool>,
}

/// Resource hint such as `2`, `0.5` or `"8Gi"`, handed to the backend as-is
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResourceValue {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceValue::Number(number) => write!(f, "{number}"),
            ResourceValue::Text(text) => write!(f, "{text}"),
        }
    }
}
