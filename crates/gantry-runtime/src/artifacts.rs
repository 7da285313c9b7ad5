//! Two-phase artifact publication.
//!
//! Pluggable artifacts go first, one extension call per plugin carrying every
//! store that plugin owns. Built-in artifacts follow and are uploaded to the
//! server one plan at a time. A failure in either phase is recorded and the
//! remaining plans still run; once both phases are done a single error names
//! every plan that failed.

use gantry_core::artifact::{
    ArtifactExtension, ArtifactPlan, ArtifactStore, ArtifactUploader, PluggableArtifactMetadata,
};
use gantry_core::assignment::OUTPUT_DIR;
use gantry_core::publisher::JobPublisher;
use gantry_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const METADATA_DIR: &str = "pluggable-artifact-metadata";
pub const CHECKSUM_FILE: &str = "md5.checksum";

/// Publishes a job's artifacts once its steps have run.
pub struct ArtifactPublicationCoordinator {
    uploader: Arc<dyn ArtifactUploader>,
    extension: Arc<dyn ArtifactExtension>,
    publisher: Arc<dyn JobPublisher>,
}

impl ArtifactPublicationCoordinator {
    pub fn new(
        uploader: Arc<dyn ArtifactUploader>,
        extension: Arc<dyn ArtifactExtension>,
        publisher: Arc<dyn JobPublisher>,
    ) -> Self {
        Self {
            uploader,
            extension,
            publisher,
        }
    }

    /// Publish every plan. Plans that fail are collected into one
    /// [`Error::ArtifactUpload`]; already published artifacts stay published.
    pub async fn publish(
        &self,
        working_dir: &Path,
        plans: &[ArtifactPlan],
        stores: &[ArtifactStore],
    ) -> Result<()> {
        if plans.is_empty() {
            return Ok(());
        }

        let mut failed: Vec<String> = Vec::new();
        self.publish_pluggable(working_dir, plans, stores, &mut failed)
            .await;
        self.publish_built_in(working_dir, plans, &mut failed).await;

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::ArtifactUpload(format!(
                "Failed to upload [{}]",
                failed.join(", ")
            )))
        }
    }

    async fn publish_pluggable(
        &self,
        working_dir: &Path,
        plans: &[ArtifactPlan],
        stores: &[ArtifactStore],
        failed: &mut Vec<String>,
    ) {
        let mut by_plugin: BTreeMap<String, BTreeMap<ArtifactStore, Vec<ArtifactPlan>>> =
            BTreeMap::new();

        for plan in plans {
            let ArtifactPlan::Pluggable { store_id, .. } = plan else {
                continue;
            };
            match stores.iter().find(|s| &s.id == store_id) {
                Some(store) => by_plugin
                    .entry(store.plugin_id.clone())
                    .or_default()
                    .entry(store.clone())
                    .or_default()
                    .push(plan.clone()),
                None => {
                    self.publisher.report_action(&format!(
                        "Artifact store [{}] is not defined",
                        store_id
                    ));
                    failed.push(plan.description());
                }
            }
        }

        for (plugin_id, artifacts) in &by_plugin {
            info!(plugin = %plugin_id, stores = artifacts.len(), "Publishing pluggable artifacts");
            let outcome = match self
                .extension
                .publish_artifact(plugin_id, artifacts, working_dir)
                .await
            {
                Ok(metadata) => self.upload_metadata(working_dir, plugin_id, &metadata).await,
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                warn!(plugin = %plugin_id, error = %e, "Pluggable artifact publish failed");
                self.publisher.report_action(&format!(
                    "Failed to publish artifacts with plugin [{}]: {}",
                    plugin_id, e
                ));
                failed.extend(artifacts.values().flatten().map(ArtifactPlan::description));
            }
        }
    }

    async fn upload_metadata(
        &self,
        working_dir: &Path,
        plugin_id: &str,
        metadata: &PluggableArtifactMetadata,
    ) -> Result<()> {
        if metadata.is_empty() {
            return Ok(());
        }
        let dir = working_dir.join(OUTPUT_DIR).join(METADATA_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!("{}.json", plugin_id);
        let path = dir.join(&file_name);
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| Error::Internal(format!("Failed to encode artifact metadata: {}", e)))?;
        tokio::fs::write(&path, &json).await?;

        let checksum = format!("{:x}", md5::compute(&json));
        self.uploader
            .upload(&path, &format!("{}/{}", METADATA_DIR, file_name), &checksum)
            .await
    }

    async fn publish_built_in(
        &self,
        working_dir: &Path,
        plans: &[ArtifactPlan],
        failed: &mut Vec<String>,
    ) {
        let mut unique: Vec<&ArtifactPlan> = Vec::new();
        for plan in plans.iter().filter(|p| !p.is_pluggable()) {
            if !unique.contains(&plan) {
                unique.push(plan);
            }
        }
        if unique.is_empty() {
            return;
        }

        let mut checksums: BTreeMap<String, String> = BTreeMap::new();
        for plan in unique {
            let ArtifactPlan::Build {
                source,
                destination,
            } = plan
            else {
                continue;
            };
            if let Err(e) = self
                .upload_build_plan(working_dir, source.trim(), destination, &mut checksums)
                .await
            {
                warn!(source = %source, error = %e, "Artifact upload failed");
                self.publisher.report_action(&e.to_string());
                failed.push(plan.description());
            }
        }

        if !checksums.is_empty() {
            if let Err(e) = self.upload_checksums(working_dir, &checksums).await {
                warn!(error = %e, "Checksum upload failed");
                self.publisher.report_action(&e.to_string());
                failed.push(CHECKSUM_FILE.to_string());
            }
        }
    }

    async fn upload_build_plan(
        &self,
        working_dir: &Path,
        source: &str,
        destination: &str,
        checksums: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let matches = resolve_source(working_dir, source)?;
        if matches.is_empty() {
            return Err(Error::ArtifactUpload(format!(
                "The rule [{}] cannot match any resource under [{}]",
                source,
                working_dir.display()
            )));
        }

        for matched in matches {
            let files = collect_files(matched.clone()).await?;
            let base = matched.parent().unwrap_or(working_dir);
            for file in files {
                let relative = file.strip_prefix(base).unwrap_or(&file);
                let remote = remote_path(destination, relative);
                let bytes = tokio::fs::read(&file).await?;
                let checksum = format!("{:x}", md5::compute(&bytes));

                debug!(file = %file.display(), remote = %remote, "Uploading artifact");
                self.publisher
                    .report_action(&format!("Uploading artifacts from {} to {}", file.display(), remote));
                self.uploader.upload(&file, &remote, &checksum).await?;
                checksums.insert(remote, checksum);
            }
        }
        Ok(())
    }

    async fn upload_checksums(
        &self,
        working_dir: &Path,
        checksums: &BTreeMap<String, String>,
    ) -> Result<()> {
        let dir = working_dir.join(OUTPUT_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(CHECKSUM_FILE);

        let content: String = checksums
            .iter()
            .map(|(file, sum)| format!("{}={}\n", file, sum))
            .collect();
        tokio::fs::write(&path, content.as_bytes()).await?;

        let checksum = format!("{:x}", md5::compute(content.as_bytes()));
        self.uploader
            .upload(&path, &format!("{}/{}", OUTPUT_DIR, CHECKSUM_FILE), &checksum)
            .await
    }
}

/// Only `source` is a pattern; the working directory is matched literally.
fn resolve_source(working_dir: &Path, source: &str) -> Result<Vec<PathBuf>> {
    let base = glob::Pattern::escape(&working_dir.to_string_lossy());
    let pattern = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        source.trim_start_matches('/')
    );
    let paths = glob::glob(&pattern).map_err(|e| {
        Error::ArtifactUpload(format!("Invalid artifact source [{}]: {}", source, e))
    })?;
    Ok(paths.filter_map(|entry| entry.ok()).collect())
}

/// Files under `path`, or `path` itself when it is a file.
async fn collect_files(path: PathBuf) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || walk_files(&path))
        .await
        .map_err(|e| Error::Internal(format!("artifact directory walk failed: {}", e)))?
}

/// Symlinked directories are not descended into.
fn walk_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_path = entry.path();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(entry_path);
            } else if kind.is_symlink() && !entry_path.is_file() {
                debug!(path = %entry_path.display(), "Skipping symlink that is not a file");
            } else {
                files.push(entry_path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn remote_path(destination: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let destination = destination.trim().trim_matches('/');
    if destination.is_empty() {
        relative
    } else {
        format!("{}/{}", destination, relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingExtension, RecordingPublisher, RecordingUploader};
    use std::fs;

    struct Fixture {
        dir: tempfile::TempDir,
        uploader: Arc<RecordingUploader>,
        extension: Arc<RecordingExtension>,
        publisher: Arc<RecordingPublisher>,
    }

    impl Fixture {
        fn new(uploader: RecordingUploader, extension: RecordingExtension) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                uploader: Arc::new(uploader),
                extension: Arc::new(extension),
                publisher: Arc::new(RecordingPublisher::default()),
            }
        }

        fn coordinator(&self) -> ArtifactPublicationCoordinator {
            ArtifactPublicationCoordinator::new(
                self.uploader.clone(),
                self.extension.clone(),
                self.publisher.clone(),
            )
        }

        fn write(&self, path: &str, content: &str) {
            let full = self.dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    fn store(id: &str, plugin: &str) -> ArtifactStore {
        ArtifactStore {
            id: id.to_string(),
            plugin_id: plugin.to_string(),
            configuration: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_plan_list_is_a_no_op() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.coordinator()
            .publish(fx.dir.path(), &[], &[])
            .await
            .unwrap();
        assert!(fx.uploader.uploads.lock().is_empty());
        assert!(fx.extension.calls.lock().is_empty());
        assert!(!fx.dir.path().join(OUTPUT_DIR).exists());
    }

    #[tokio::test]
    async fn test_failed_plan_is_named_and_others_upload() {
        // b.txt matches nothing; a.txt and c.txt still upload and only b.txt is named.
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.write("a.txt", "A");
        fx.write("c.txt", "C");
        let plans = vec![
            ArtifactPlan::build("a.txt", "out"),
            ArtifactPlan::build("b.txt", "out"),
            ArtifactPlan::build("c.txt", "out"),
        ];

        let err = fx
            .coordinator()
            .publish(fx.dir.path(), &plans, &[])
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to upload [b.txt]");
        assert_eq!(
            fx.uploader.remote_paths(),
            vec!["out/a.txt", "out/c.txt", "cruise-output/md5.checksum"]
        );
        assert!(fx.publisher.has_line(&format!(
            "The rule [b.txt] cannot match any resource under [{}]",
            fx.dir.path().display()
        )));
    }

    #[tokio::test]
    async fn test_upload_failure_is_aggregated() {
        let fx = Fixture::new(
            RecordingUploader::default().failing("pkg/a.txt"),
            RecordingExtension::default(),
        );
        fx.write("a.txt", "A");
        fx.write("b.txt", "B");
        let plans = vec![
            ArtifactPlan::build("a.txt", "pkg"),
            ArtifactPlan::build("b.txt", "pkg"),
        ];

        let err = fx
            .coordinator()
            .publish(fx.dir.path(), &plans, &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to upload [a.txt]");
        assert!(fx.uploader.remote_paths().contains(&"pkg/b.txt".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_plans_upload_once() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.write("a.txt", "A");
        let plans = vec![
            ArtifactPlan::build("a.txt", "out"),
            ArtifactPlan::build("a.txt", "out"),
        ];

        fx.coordinator()
            .publish(fx.dir.path(), &plans, &[])
            .await
            .unwrap();
        assert_eq!(
            fx.uploader.remote_paths(),
            vec!["out/a.txt", "cruise-output/md5.checksum"]
        );
    }

    #[tokio::test]
    async fn test_glob_and_directory_sources() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.write("target/one.jar", "1");
        fx.write("target/two.jar", "2");
        fx.write("reports/html/index.html", "<html/>");
        fx.write("reports/summary.txt", "ok");
        let plans = vec![
            ArtifactPlan::build("target/*.jar", "libs"),
            ArtifactPlan::build("reports", ""),
        ];

        fx.coordinator()
            .publish(fx.dir.path(), &plans, &[])
            .await
            .unwrap();

        let paths = fx.uploader.remote_paths();
        assert!(paths.contains(&"libs/one.jar".to_string()));
        assert!(paths.contains(&"libs/two.jar".to_string()));
        assert!(paths.contains(&"reports/html/index.html".to_string()));
        assert!(paths.contains(&"reports/summary.txt".to_string()));
    }

    #[tokio::test]
    async fn test_working_dir_with_glob_characters_is_matched_literally() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.write("pipe[1]/a.txt", "A");
        fx.write("pipe1/a.txt", "decoy");
        let working_dir = fx.dir.path().join("pipe[1]");

        fx.coordinator()
            .publish(&working_dir, &[ArtifactPlan::build("a.txt", "out")], &[])
            .await
            .unwrap();

        assert_eq!(
            fx.uploader.remote_paths(),
            vec!["out/a.txt", "cruise-output/md5.checksum"]
        );
        assert_eq!(fx.uploader.contents.lock()["out/a.txt"], "A");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_walk_does_not_follow_symlinked_directories() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.write("reports/summary.txt", "ok");
        std::os::unix::fs::symlink(
            fx.dir.path().join("reports"),
            fx.dir.path().join("reports/loop"),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            fx.dir.path().join("reports/summary.txt"),
            fx.dir.path().join("reports/latest.txt"),
        )
        .unwrap();

        fx.coordinator()
            .publish(fx.dir.path(), &[ArtifactPlan::build("reports", "")], &[])
            .await
            .unwrap();

        assert_eq!(
            fx.uploader.remote_paths(),
            vec![
                "reports/latest.txt",
                "reports/summary.txt",
                "cruise-output/md5.checksum"
            ]
        );
    }

    #[tokio::test]
    async fn test_checksum_file_lists_every_upload() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        fx.write("a.txt", "hello");
        fx.coordinator()
            .publish(fx.dir.path(), &[ArtifactPlan::build("a.txt", "")], &[])
            .await
            .unwrap();

        let contents = fx.uploader.contents.lock();
        assert_eq!(
            contents["cruise-output/md5.checksum"],
            "a.txt=5d41402abc4b2a76b9719d911017c592\n"
        );
    }

    #[tokio::test]
    async fn test_stores_of_one_plugin_share_a_call() {
        let fx = Fixture::new(RecordingUploader::default(), RecordingExtension::default());
        let stores = vec![
            store("s3-east", "cd.go.s3"),
            store("s3-west", "cd.go.s3"),
            store("docker", "cd.go.docker"),
        ];
        let plans = vec![
            ArtifactPlan::pluggable("installers", "s3-east"),
            ArtifactPlan::pluggable("docs", "s3-west"),
        ];

        fx.coordinator()
            .publish(fx.dir.path(), &plans, &stores)
            .await
            .unwrap();

        let calls = fx.extension.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "cd.go.s3");
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(calls[0].1[&stores[0]], vec![plans[0].clone()]);
        assert_eq!(calls[0].1[&stores[1]], vec![plans[1].clone()]);

        assert!(fx
            .dir
            .path()
            .join("cruise-output/pluggable-artifact-metadata/cd.go.s3.json")
            .exists());
        assert_eq!(
            fx.uploader.remote_paths(),
            vec!["pluggable-artifact-metadata/cd.go.s3.json"]
        );
    }

    #[tokio::test]
    async fn test_failing_plugin_does_not_stop_other_plugins_or_built_ins() {
        let fx = Fixture::new(
            RecordingUploader::default(),
            RecordingExtension::default().failing("cd.go.docker"),
        );
        fx.write("a.txt", "A");
        let stores = vec![store("docker", "cd.go.docker"), store("s3", "cd.go.s3")];
        let plans = vec![
            ArtifactPlan::pluggable("image", "docker"),
            ArtifactPlan::pluggable("installers", "s3"),
            ArtifactPlan::pluggable("orphan", "nowhere"),
            ArtifactPlan::build("a.txt", ""),
        ];

        let err = fx
            .coordinator()
            .publish(fx.dir.path(), &plans, &stores)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed to upload [orphan (store nowhere), image (store docker)]"
        );
        assert_eq!(fx.extension.calls.lock().len(), 2);
        assert!(fx.uploader.remote_paths().contains(&"a.txt".to_string()));
    }
}
