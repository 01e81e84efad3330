//! Object storage for run configs, provenance sidecars, membership lists and workflow outputs
//!
//! Blobs are addressed with `scheme://bucket/key` URIs. Production storage talks the S3 protocol
//! (Cloud Storage serves it through its interoperability endpoint), tests use [MemoryBlobStore].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use log::info;
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_credential::ChainProvider;
use rusoto_s3::{GetObjectError, GetObjectRequest, PutObjectRequest, S3, S3Client};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid blob URI \"{0}\"")]
    InvalidUri(String),
    #[error("reading {uri} failed: {message}")]
    Read { uri: String, message: String },
    #[error("writing {uri} failed: {message}")]
    Write { uri: String, message: String },
    #[error("storage client setup failed: {0}")]
    Client(String),
}

/// Location of a single blob
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobUri {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl BlobUri {
    pub fn parse(uri: &str) -> Result<BlobUri, StorageError> {
        let (scheme, rest) = uri.split_once("://")
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if scheme.is_empty() || bucket.is_empty() {
            return Err(StorageError::InvalidUri(uri.to_string()));
        }
        Ok(BlobUri {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    /// Append a relative path below this location
    pub fn join(&self, path: &str) -> BlobUri {
        let path = path.trim_matches('/');
        let key = match (self.key.is_empty(), path.is_empty()) {
            (true, _) => path.to_string(),
            (false, true) => self.key.clone(),
            (false, false) => format!("{}/{}", self.key, path),
        };
        BlobUri { scheme: self.scheme.clone(), bucket: self.bucket.clone(), key }
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` when it doesn't exist
    async fn get(&self, uri: &BlobUri) -> Result<Option<Vec<u8>>, StorageError>;

    /// Create or replace a blob
    async fn put(&self, uri: &BlobUri, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;
}

/// S3 protocol client. The bucket name comes from the URI, the scheme is ignored.
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    /// Connect to a custom endpoint (e.g. `https://storage.googleapis.com`), or AWS when `None`
    pub fn new(endpoint: Option<&str>, region: &str) -> Result<S3BlobStore, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom { name: region.to_string(), endpoint: endpoint.to_string() },
            None => region.parse::<Region>().map_err(|err| StorageError::Client(err.to_string()))?,
        };
        info!("Connecting to object storage in region {}", region.name());
        let http = HttpClient::new().map_err(|err| StorageError::Client(err.to_string()))?;
        let client = S3Client::new_with(http, ChainProvider::new(), region);
        Ok(S3BlobStore { client })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, uri: &BlobUri) -> Result<Option<Vec<u8>>, StorageError> {
        let request = GetObjectRequest {
            bucket: uri.bucket.clone(),
            key: uri.key.clone(),
            ..Default::default()
        };
        let read_error = |message: String| StorageError::Read { uri: uri.to_string(), message };

        let output = match self.client.get_object(request).await {
            Ok(output) => output,
            Err(RusotoError::Service(GetObjectError::NoSuchKey(_))) => return Ok(None),
            // HEAD-less GETs on missing keys can surface as a bare 404
            Err(RusotoError::Unknown(response)) if response.status.as_u16() == 404 => return Ok(None),
            Err(err) => return Err(read_error(err.to_string())),
        };

        let body = output.body.ok_or_else(|| read_error("empty response body".to_string()))?;
        let mut bytes = Vec::new();
        body.into_async_read()
            .read_to_end(&mut bytes)
            .await
            .map_err(|err| read_error(err.to_string()))?;
        Ok(Some(bytes))
    }

    async fn put(&self, uri: &BlobUri, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let request = PutObjectRequest {
            bucket: uri.bucket.clone(),
            key: uri.key.clone(),
            body: Some(body.into()),
            content_type: Some(content_type.to_string()),
            ..Default::default()
        };
        self.client.put_object(request).await
            .map_err(|err| StorageError::Write { uri: uri.to_string(), message: err.to_string() })?;
        Ok(())
    }
}

/// In-process blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<BlobUri, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> MemoryBlobStore {
        MemoryBlobStore::default()
    }

    /// Every stored URI, in order
    pub async fn uris(&self) -> Vec<BlobUri> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, uri: &BlobUri) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.read().await.get(uri).cloned())
    }

    async fn put(&self, uri: &BlobUri, body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        self.blobs.write().await.insert(uri.clone(), body);
        Ok(())
    }
}
