use std::sync::Arc;

use anyhow::{anyhow, Result};
use jsonschema::{JSONSchema, SchemaResolver, SchemaResolverError};
use log::warn;
use serde_json::Value;
use url::Url;

use crate::error::RunnerError;

static COMMON: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/common.json"));
static SUBMISSION: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/submission.json"));
static CONFIG: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/config.json"));
static CROMWELL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/cromwell.json"));

/// Which endpoint a request body was sent to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Submission,
    Config,
    Cromwell,
}

/// Compiled structural schemas for every request body
pub struct RequestSchemas {
    submission: JSONSchema,
    config: JSONSchema,
    cromwell: JSONSchema,
}

impl RequestSchemas {
    pub fn load() -> Result<RequestSchemas> {
        Ok(RequestSchemas {
            submission: compile_schema(SUBMISSION)?,
            config: compile_schema(CONFIG)?,
            cromwell: compile_schema(CROMWELL)?,
        })
    }

    /// Check a raw body, naming the first offending field on failure
    pub fn validate(&self, kind: RequestKind, json: &Value) -> Result<(), RunnerError> {
        let schema = match kind {
            RequestKind::Submission => &self.submission,
            RequestKind::Config => &self.config,
            RequestKind::Cromwell => &self.cromwell,
        };

        let result = schema.validate(json);
        if let Err(mut errors) = result {
            let error = errors.next();
            warn!("Request fails {:?} schema validation", kind);
            return Err(match error {
                Some(error) => {
                    let path = error.instance_path.to_string();
                    let field = path.trim_start_matches('/');
                    RunnerError::validation(if field.is_empty() { "request" } else { field }, error.to_string())
                }
                None => RunnerError::validation("request", "request doesn't match the schema"),
            });
        }
        Ok(())
    }
}

fn compile_schema(document: &str) -> Result<JSONSchema> {
    let schema: Value = serde_json::from_str(document)?;
    JSONSchema::options()
        .with_resolver(EmbeddedResolver)
        .compile(&schema)
        .map_err(|err| anyhow!("Invalid request schema: {err}"))
}

/*
Schemas reference shared definitions in common.json with relative references. All documents are
compiled into the binary, so references resolve against the embedded copies and nothing is
fetched at runtime.
*/
struct EmbeddedResolver;

impl SchemaResolver for EmbeddedResolver {
    fn resolve(&self, _root_schema: &Value, url: &Url, _original_reference: &str) -> Result<Arc<Value>, SchemaResolverError> {
        if url.scheme() != "json-schema" {
            return Err(anyhow!("scheme is not supported"));
        }
        let document = match url.path().trim_start_matches('/') {
            "common.json" => COMMON,
            "submission.json" => SUBMISSION,
            "config.json" => CONFIG,
            "cromwell.json" => CROMWELL,
            other => return Err(anyhow!("unknown schema {other}")),
        };
        Ok(Arc::new(serde_json::from_str(document)?))
    }
}
