use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use log::info;

use crate::policy::server_config::ServerConfig;
use crate::storage::{BlobStore, BlobUri};

/// Where the server config is read from
pub enum ConfigSource {
    File(PathBuf),
    Blob { store: Arc<dyn BlobStore>, uri: BlobUri },
    /// Fixed value, reloading is a no-op
    Fixed,
}

/// Holder of the current [ServerConfig]
///
/// Readers take a cheap `Arc` snapshot per request. [PolicyStore::reload] swaps the whole value,
/// so a request never observes a half-updated config.
pub struct PolicyStore {
    source: ConfigSource,
    current: RwLock<Arc<ServerConfig>>,
}

impl PolicyStore {
    pub async fn load(source: ConfigSource) -> Result<PolicyStore> {
        let config = read(&source).await?
            .ok_or_else(|| anyhow!("A fixed config source needs PolicyStore::fixed"))?;
        info!("Loaded server config with {} datasets", config.datasets.len());
        Ok(PolicyStore { source, current: RwLock::new(Arc::new(config)) })
    }

    pub fn fixed(config: ServerConfig) -> PolicyStore {
        PolicyStore { source: ConfigSource::Fixed, current: RwLock::new(Arc::new(config)) }
    }

    pub fn current(&self) -> Arc<ServerConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the source and swap in the new config. On error the previous config stays.
    pub async fn reload(&self) -> Result<()> {
        let Some(config) = read(&self.source).await? else {
            return Ok(());
        };
        info!("Reloaded server config with {} datasets", config.datasets.len());
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
        Ok(())
    }
}

async fn read(source: &ConfigSource) -> Result<Option<ServerConfig>> {
    let bytes = match source {
        ConfigSource::File(path) => tokio::fs::read(path).await
            .with_context(|| format!("Can't read server config at {}", path.display()))?,
        ConfigSource::Blob { store, uri } => store.get(uri).await?
            .ok_or_else(|| anyhow!("Server config {} doesn't exist", uri))?,
        ConfigSource::Fixed => return Ok(None),
    };
    let config = serde_json::from_slice(&bytes).context("Server config isn't valid JSON")?;
    Ok(Some(config))
}
