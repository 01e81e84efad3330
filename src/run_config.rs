//! Run configuration handed to every dispatched job
//!
//! A run config is a baseline built from the authorized request, layered with environment
//! templates, with the caller's overlay merged on top. It's written once as TOML next to the other
//! configs for the cloud environment and the job finds it through `CPG_CONFIG_PATH`.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use serde_json::{json, Map, Value};

use crate::error::RunnerError;
use crate::namespace::{AccessLevel, CloudEnvironment};
use crate::storage::{BlobStore, BlobUri};

/// Run id shown by `POST /config`, where nothing is dispatched
pub const PREVIEW_RUN_ID: &str = "<generated-at-runtime>";

/// Scalars that make up the baseline section
#[derive(Clone, Debug)]
pub struct BaselineArgs<'a> {
    pub run_id: &'a str,
    pub environment: CloudEnvironment,
    pub project: &'a str,
    pub dataset: &'a str,
    pub access_level: AccessLevel,
    pub output_prefix: &'a str,
    pub driver_image: &'a str,
}

/// Build the baseline deterministically from the request
pub fn baseline(args: &BaselineArgs) -> Value {
    json!({
        "hail": {
            "billing_project": args.dataset,
            "bucket": format!("cpg-{}-hail", args.dataset),
        },
        "workflow": {
            "ar_guid": args.run_id,
            "access_level": args.access_level.to_string(),
            "dataset": args.dataset,
            "dataset_gcp_project": args.project,
            "driver_image": args.driver_image,
            "environment": args.environment.to_string(),
            "output_prefix": args.output_prefix,
            "status_reporter": "metamist",
        },
    })
}

/// Merge `overlay` on top of `base`
///
/// Mappings merge key by key at any depth. Anything else in the overlay, arrays included, replaces
/// the base value outright. The overlay is only read.
pub fn deep_merge(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                base_map.insert(key.clone(), merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Layer templates in order on the baseline, then the caller's overlay
pub fn assemble(baseline: Value, templates: &[Value], overlay: Option<&Value>) -> Value {
    let layered = templates.iter().fold(baseline, deep_merge);
    match overlay {
        Some(overlay) => deep_merge(layered, overlay),
        None => layered,
    }
}

/// Serialise a run config as TOML, which has no null: null entries are dropped
pub fn to_toml(config: &Value) -> Result<String, RunnerError> {
    toml::to_string(&strip_nulls(config.clone()))
        .map_err(|err| RunnerError::Internal(format!("Can't serialise run config: {err}")))
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key, strip_nulls(value)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(values) => Value::Array(values.into_iter().filter(|v| !v.is_null()).map(strip_nulls).collect()),
        other => other,
    }
}

/// Substitutions applied to template locations
#[derive(Clone, Debug)]
pub struct TemplateContext<'a> {
    pub environment: CloudEnvironment,
    pub dataset: &'a str,
    pub namespace: &'a str,
}

/// Loads template layers and writes finished run configs
pub struct RunConfigWriter {
    store: Arc<dyn BlobStore>,
    /// Where run configs go, per cloud environment
    prefixes: BTreeMap<CloudEnvironment, BlobUri>,
    /// Template locations with `{environment}`, `{dataset}` and `{namespace}` placeholders
    templates: Vec<String>,
}

impl RunConfigWriter {
    pub fn new(store: Arc<dyn BlobStore>, prefixes: BTreeMap<CloudEnvironment, BlobUri>, templates: Vec<String>) -> RunConfigWriter {
        RunConfigWriter { store, prefixes, templates }
    }

    /// Read every template layer, failing with all missing locations named at once
    pub async fn load_templates(&self, context: &TemplateContext<'_>) -> Result<Vec<Value>, RunnerError> {
        let mut layers = Vec::with_capacity(self.templates.len());
        let mut missing = Vec::new();

        for template in &self.templates {
            let location = template
                .replace("{environment}", &context.environment.to_string())
                .replace("{dataset}", context.dataset)
                .replace("{namespace}", context.namespace);
            let uri = BlobUri::parse(&location)?;
            match self.store.get(&uri).await? {
                Some(body) => layers.push(parse_template(&uri, &body)?),
                None => missing.push(uri.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(RunnerError::Internal(format!("Missing config templates: {}", missing.join(", "))));
        }
        Ok(layers)
    }

    /// Write the config to `{prefix}/{run_id}.toml` and return where it went
    pub async fn write(&self, config: &Value, run_id: &str, environment: CloudEnvironment) -> Result<BlobUri, RunnerError> {
        let prefix = self.prefixes.get(&environment).ok_or_else(|| {
            RunnerError::Internal(format!("No run config location for the {environment} environment"))
        })?;
        let uri = prefix.join(&format!("{run_id}.toml"));
        let body = to_toml(config)?;
        self.store.put(&uri, body.into_bytes(), "application/toml").await?;
        info!("Wrote run config to {uri}");
        Ok(uri)
    }
}

fn parse_template(uri: &BlobUri, body: &[u8]) -> Result<Value, RunnerError> {
    let text = std::str::from_utf8(body)
        .map_err(|err| RunnerError::Internal(format!("Config template {uri} isn't UTF-8: {err}")))?;
    toml::from_str::<Value>(text)
        .map_err(|err| RunnerError::Internal(format!("Config template {uri} isn't valid TOML: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    fn args() -> BaselineArgs<'static> {
        BaselineArgs {
            run_id: "run-1",
            environment: CloudEnvironment::Gcp,
            project: "fewgenomes-1234",
            dataset: "fewgenomes",
            access_level: AccessLevel::Test,
            output_prefix: "gs://cpg-fewgenomes-test/qc",
            driver_image: "driver:1",
        }
    }

    #[test]
    fn merge_is_deep() {
        let merged = deep_merge(json!({"a": {"b": 1, "c": 2}}), &json!({"a": {"b": 9}}));
        assert_eq!(merged, json!({"a": {"b": 9, "c": 2}}));
    }

    #[test]
    fn merge_replaces_arrays() {
        assert_eq!(deep_merge(json!({"a": [1, 2]}), &json!({"a": [3]})), json!({"a": [3]}));
        assert_eq!(deep_merge(json!({"a": {"b": 1}}), &json!({"a": "flat"})), json!({"a": "flat"}));
    }

    #[test]
    fn merge_with_empty_overlay_is_identity() {
        let base = baseline(&args());
        assert_eq!(deep_merge(base.clone(), &json!({})), base);
        assert_eq!(assemble(base.clone(), &[], None), base);
    }

    #[test]
    fn overlay_is_not_mutated() {
        let overlay = json!({"workflow": {"sequencing_type": "genome"}, "x": [1]});
        let before = overlay.clone();
        let _ = assemble(baseline(&args()), &[], Some(&overlay));
        assert_eq!(overlay, before);
    }

    #[test]
    fn overlay_wins_over_templates() {
        let templates = vec![json!({"workflow": {"status_reporter": null, "sequencing_type": "exome"}})];
        let config = assemble(baseline(&args()), &templates, Some(&json!({"workflow": {"sequencing_type": "genome"}})));
        assert_eq!(config["workflow"]["sequencing_type"], "genome");
        assert_eq!(config["workflow"]["ar_guid"], "run-1");
        assert!(config["workflow"]["status_reporter"].is_null());
    }

    #[test]
    fn toml_drops_nulls() {
        let config = json!({"workflow": {"a": null, "b": "x"}, "top": 1});
        let text = to_toml(&config).unwrap();
        assert!(text.contains("b = \"x\""));
        assert!(!text.contains("a ="));
    }

    #[tokio::test]
    async fn writes_config_and_reports_missing_templates() {
        let store = Arc::new(MemoryBlobStore::new());
        let template = BlobUri::parse("gs://cpg-config/templates/storage/gcp/fewgenomes-test.toml").unwrap();
        store.put(&template, b"[storage.default]\ndefault = \"gs://cpg-fewgenomes-test\"\n".to_vec(), "application/toml").await.unwrap();

        let prefixes = BTreeMap::from([(CloudEnvironment::Gcp, BlobUri::parse("gs://cpg-config/config").unwrap())]);
        let writer = RunConfigWriter::new(
            store.clone(),
            prefixes,
            vec!["gs://cpg-config/templates/storage/{environment}/{dataset}-{namespace}.toml".to_string()],
        );
        let context = TemplateContext { environment: CloudEnvironment::Gcp, dataset: "fewgenomes", namespace: "test" };
        let layers = writer.load_templates(&context).await.unwrap();
        assert_eq!(layers[0]["storage"]["default"]["default"], "gs://cpg-fewgenomes-test");

        let uri = writer.write(&assemble(baseline(&args()), &layers, None), "run-1", CloudEnvironment::Gcp).await.unwrap();
        assert_eq!(uri.to_string(), "gs://cpg-config/config/run-1.toml");
        let written = store.get(&uri).await.unwrap().unwrap();
        assert!(String::from_utf8(written).unwrap().contains("ar_guid = \"run-1\""));

        let other = TemplateContext { dataset: "unknown", ..context };
        let err = writer.load_templates(&other).await.unwrap_err();
        assert!(err.to_string().contains("unknown-test.toml"));

        assert!(writer.write(&json!({}), "run-2", CloudEnvironment::Azure).await.is_err());
    }
}
