use std::fmt;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Access level requested for a run
///
/// The access level decides which credential a job runs with, whether arbitrary images are
/// allowed, and whether the commit has to be merged into the default branch before it runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Test,
    Standard,
    Full
}

impl AccessLevel {
    pub fn is_test(&self) -> bool {
        matches!(self, AccessLevel::Test)
    }

    /// Storage namespace a run at this access level reads and writes
    pub fn namespace(&self) -> StorageNamespace {
        match self {
            AccessLevel::Test => StorageNamespace::Test,
            AccessLevel::Standard | AccessLevel::Full => StorageNamespace::Main
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AccessLevel::Test => write!(f, "test"),
            AccessLevel::Standard => write!(f, "standard"),
            AccessLevel::Full => write!(f, "full")
        }
    }
}

/// Bucket namespace, `test` buckets are kept apart from everything else
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageNamespace {
    Test,
    Main
}

impl fmt::Display for StorageNamespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageNamespace::Test => write!(f, "test"),
            StorageNamespace::Main => write!(f, "main")
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudEnvironment {
    #[default]
    Gcp,
    Azure
}

impl fmt::Display for CloudEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloudEnvironment::Gcp => write!(f, "gcp"),
            CloudEnvironment::Azure => write!(f, "azure")
        }
    }
}
