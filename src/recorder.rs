//! Provenance of every run
//!
//! Each run appends a record to a JSON list kept next to its outputs and publishes the same
//! record as a submission event. Both are best effort: failures are logged and reported in the
//! outcome, never turned into a failed submission.
//!
//! The sidecar append is a plain read-modify-write. Two runs writing to the same output prefix at
//! nearly the same time can both read the old list, and the later write drops the other record.

use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::publish::EventPublisher;
use crate::storage::{BlobStore, BlobUri};

/// Who ran what, when, and where the output went
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    #[serde(rename = "ar-guid")]
    pub ar_guid: String,
    pub name: String,
    /// RFC 3339 with the server's local offset
    pub timestamp: String,
    pub dataset: String,
    pub user: String,
    pub access_level: String,
    pub repo: Option<String>,
    pub commit: Option<String>,
    pub script: String,
    pub description: String,
    pub output: String,
    pub driver_image: String,
    pub config_path: String,
    pub cwd: Option<String>,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// What happened to a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordOutcome {
    pub sidecar_written: bool,
    pub published: bool,
}

pub struct MetadataRecorder {
    store: Arc<dyn BlobStore>,
    publisher: Arc<dyn EventPublisher>,
    /// File name of the record list below each output prefix
    sidecar_name: String,
}

impl MetadataRecorder {
    pub fn new(store: Arc<dyn BlobStore>, publisher: Arc<dyn EventPublisher>, sidecar_name: &str) -> MetadataRecorder {
        MetadataRecorder { store, publisher, sidecar_name: sidecar_name.to_string() }
    }

    /// Append `record` to the sidecar under `output_prefix`, then publish it with `tracking_url`
    ///
    /// Returns once the publish was acknowledged or has failed.
    pub async fn record(&self, output_prefix: &str, record: &ProvenanceRecord, tracking_url: &str) -> RecordOutcome {
        let sidecar_written = match self.append(output_prefix, record).await {
            Ok(uri) => {
                info!("Appended provenance for {} to {}", record.ar_guid, uri);
                true
            }
            Err(err) => {
                error!("Can't record provenance for {}: {}", record.ar_guid, err);
                false
            }
        };

        let mut event = serde_json::to_value(record).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut event {
            fields.insert("batch_url".to_string(), Value::String(tracking_url.to_string()));
        }
        let published = match self.publisher.publish(&event).await {
            Ok(()) => true,
            Err(err) => {
                error!("Submission event for {} wasn't published: {}", record.ar_guid, err);
                false
            }
        };

        RecordOutcome { sidecar_written, published }
    }

    async fn append(&self, output_prefix: &str, record: &ProvenanceRecord) -> Result<BlobUri, String> {
        let uri = BlobUri::parse(output_prefix).map_err(|err| err.to_string())?.join(&self.sidecar_name);
        let mut records = self.existing(&uri).await;
        records.push(serde_json::to_value(record).map_err(|err| err.to_string())?);

        let body = serde_json::to_vec_pretty(&records).map_err(|err| err.to_string())?;
        self.store.put(&uri, body, "application/json").await.map_err(|err| err.to_string())?;
        Ok(uri)
    }

    /// Records already at `uri`, empty when there are none or they can't be read
    async fn existing(&self, uri: &BlobUri) -> Vec<Value> {
        let body = match self.store.get(uri).await {
            Ok(Some(body)) => body,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!("Can't read existing provenance at {uri}, starting a new list: {err}");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(records)) => records,
            Ok(record @ Value::Object(_)) => vec![record],
            Ok(_) | Err(_) => {
                warn!("Existing provenance at {uri} isn't a record list, starting a new list");
                Vec::new()
            }
        }
    }
}
