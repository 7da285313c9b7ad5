//! Artifact plans, stores and the transfer seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;

/// Named external destination owned by an artifact plugin.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactStore {
    pub id: String,
    pub plugin_id: String,
    pub configuration: BTreeMap<String, String>,
}

/// One artifact to capture once the build is done.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactPlan {
    /// Copied to the server by the agent itself.
    Build {
        /// Glob pattern relative to the working directory.
        source: String,
        /// Destination directory relative to the job's artifact root.
        destination: String,
    },
    /// Handed to the plugin owning `store_id`.
    Pluggable {
        id: String,
        store_id: String,
        configuration: BTreeMap<String, String>,
    },
}

impl ArtifactPlan {
    pub fn build(source: impl Into<String>, destination: impl Into<String>) -> Self {
        ArtifactPlan::Build {
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn pluggable(id: impl Into<String>, store_id: impl Into<String>) -> Self {
        ArtifactPlan::Pluggable {
            id: id.into(),
            store_id: store_id.into(),
            configuration: BTreeMap::new(),
        }
    }

    pub fn is_pluggable(&self) -> bool {
        matches!(self, ArtifactPlan::Pluggable { .. })
    }

    /// Short form used when reporting failures.
    pub fn description(&self) -> String {
        match self {
            ArtifactPlan::Build { source, .. } => source.trim().to_string(),
            ArtifactPlan::Pluggable { id, store_id, .. } => format!("{} (store {})", id, store_id),
        }
    }
}

/// Metadata plugins return for the artifacts they published, keyed by artifact id.
pub type PluggableArtifactMetadata = BTreeMap<String, serde_json::Value>;

/// Publishes pluggable artifacts through the plugin owning their stores.
#[async_trait]
pub trait ArtifactExtension: Send + Sync {
    /// One call per plugin, carrying every store it owns with that store's plans.
    async fn publish_artifact(
        &self,
        plugin_id: &str,
        artifacts: &BTreeMap<ArtifactStore, Vec<ArtifactPlan>>,
        working_dir: &Path,
    ) -> Result<PluggableArtifactMetadata>;
}

/// Uploads one local file into the job's artifact area on the server.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// `remote_path` is relative to the job's artifact root and includes the file name.
    async fn upload(&self, local: &Path, remote_path: &str, checksum: &str) -> Result<()>;
}

/// Downloads artifacts published by upstream jobs.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, job: &str, source: &str, destination: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_trims_source() {
        let plan = ArtifactPlan::build("logs/pic-1 ", "mypic");
        assert_eq!(plan.description(), "logs/pic-1");
    }

    #[test]
    fn test_pluggable_description_names_store() {
        let plan = ArtifactPlan::pluggable("installers", "s3");
        assert!(plan.is_pluggable());
        assert_eq!(plan.description(), "installers (store s3)");
    }

    #[test]
    fn test_stores_order_by_id() {
        let a = ArtifactStore {
            id: "a".to_string(),
            plugin_id: "z".to_string(),
            configuration: BTreeMap::new(),
        };
        let b = ArtifactStore {
            id: "b".to_string(),
            plugin_id: "a".to_string(),
            configuration: BTreeMap::new(),
        };
        assert!(a < b);
    }
}
