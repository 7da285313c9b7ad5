//! Collaborators used when running outside a full server installation.

use async_trait::async_trait;
use gantry_core::artifact::{
    ArtifactExtension, ArtifactPlan, ArtifactStore, PluggableArtifactMetadata,
};
use gantry_core::material::{MaterialRevision, MaterialSync};
use gantry_core::publisher::JobPublisher;
use gantry_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Expects materials to be checked out already and only records what the job asked for.
pub struct PreparedMaterials;

#[async_trait]
impl MaterialSync for PreparedMaterials {
    async fn sync(
        &self,
        revisions: &[MaterialRevision],
        working_dir: &Path,
        publisher: &dyn JobPublisher,
    ) -> Result<()> {
        for revision in revisions {
            let dest = match &revision.destination {
                Some(dest) => working_dir.join(dest),
                None => working_dir.to_path_buf(),
            };
            info!(material = %revision.name, revision = %revision.revision, "Using pre-fetched material");
            publisher.report_action(&format!(
                "Using {} material [{}] at revision {} in {}",
                revision.kind,
                revision.url,
                revision.revision,
                dest.display()
            ));
        }
        Ok(())
    }
}

/// No artifact plugins are installed on a standalone agent.
pub struct NoArtifactPlugins;

#[async_trait]
impl ArtifactExtension for NoArtifactPlugins {
    async fn publish_artifact(
        &self,
        plugin_id: &str,
        _artifacts: &BTreeMap<ArtifactStore, Vec<ArtifactPlan>>,
        _working_dir: &Path,
    ) -> Result<PluggableArtifactMetadata> {
        Err(Error::NotFound(format!(
            "no artifact plugin registered for '{}'",
            plugin_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pluggable_artifacts_need_a_plugin() {
        let err = NoArtifactPlugins
            .publish_artifact("cd.go.s3", &BTreeMap::new(), Path::new("."))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "not found: no artifact plugin registered for 'cd.go.s3'"
        );
    }
}
