use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::storage::{BlobStore, BlobUri, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("membership list for {group} is missing")]
    MissingGroup { group: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("membership list for {group} isn't UTF-8")]
    Encoding { group: String },
    #[error("membership lookup timed out")]
    Timeout,
}

/// Lookup of cached group memberships
///
/// The cache is filled by a separate process. Callers treat any error as "not a member".
#[async_trait]
pub trait MembershipCache: Send + Sync {
    async fn is_member(&self, group: &str, email: &str) -> Result<bool, MembershipError>;
}

/// Membership lists stored as `{location}/{group}-members.txt`, comma or newline separated
pub struct BlobMembershipCache {
    store: Arc<dyn BlobStore>,
    location: BlobUri,
}

impl BlobMembershipCache {
    pub fn new(store: Arc<dyn BlobStore>, location: BlobUri) -> BlobMembershipCache {
        BlobMembershipCache { store, location }
    }
}

#[async_trait]
impl MembershipCache for BlobMembershipCache {
    async fn is_member(&self, group: &str, email: &str) -> Result<bool, MembershipError> {
        let uri = self.location.join(&format!("{group}-members.txt"));
        info!("Reading membership list {}", uri);
        let bytes = self.store.get(&uri).await?
            .ok_or_else(|| MembershipError::MissingGroup { group: group.to_string() })?;
        let members = String::from_utf8(bytes)
            .map_err(|_| MembershipError::Encoding { group: group.to_string() })?;

        Ok(members
            .split(|c: char| c == ',' || c.is_whitespace())
            .any(|member| member.trim().eq_ignore_ascii_case(email)))
    }
}

/// Fixed group memberships
#[derive(Clone, Debug, Default)]
pub struct StaticMembership {
    groups: HashMap<String, HashSet<String>>,
}

impl StaticMembership {
    pub fn new() -> StaticMembership {
        StaticMembership::default()
    }

    pub fn with_member(mut self, group: &str, email: &str) -> StaticMembership {
        self.groups.entry(group.to_string()).or_default().insert(email.to_lowercase());
        self
    }
}

#[async_trait]
impl MembershipCache for StaticMembership {
    async fn is_member(&self, group: &str, email: &str) -> Result<bool, MembershipError> {
        Ok(self.groups.get(group).is_some_and(|members| members.contains(&email.to_lowercase())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[tokio::test]
    async fn reads_comma_separated_list() {
        let store = Arc::new(MemoryBlobStore::new());
        let location = BlobUri::parse("gs://cpg-members-cache").unwrap();
        store.put(
            &location.join("fewgenomes-access@example.org-members.txt"),
            b"alice@example.org,Bob@example.org\n".to_vec(),
            "text/plain",
        ).await.unwrap();

        let cache = BlobMembershipCache::new(store, location);
        assert!(cache.is_member("fewgenomes-access@example.org", "bob@example.org").await.unwrap());
        assert!(!cache.is_member("fewgenomes-access@example.org", "eve@example.org").await.unwrap());
    }

    #[tokio::test]
    async fn missing_group_is_an_error() {
        let cache = BlobMembershipCache::new(
            Arc::new(MemoryBlobStore::new()),
            BlobUri::parse("gs://cpg-members-cache").unwrap(),
        );
        let result = cache.is_member("nobody-access@example.org", "alice@example.org").await;
        assert!(matches!(result, Err(MembershipError::MissingGroup { .. })));
    }
}
