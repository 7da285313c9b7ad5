//! In-memory collaborators shared by the runtime tests.

use async_trait::async_trait;
use gantry_core::artifact::{
    ArtifactExtension, ArtifactPlan, ArtifactStore, ArtifactUploader, PluggableArtifactMetadata,
};
use gantry_core::material::{MaterialRevision, MaterialSync};
use gantry_core::publisher::{JobPublisher, StatusReporter};
use gantry_core::step::{BuildStep, JobResult, JobState, RunIfPolicy, StepContext, StepRunner};
use gantry_core::{Error, JobIdentifier, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct RecordingPublisher {
    pub lines: Mutex<Vec<String>>,
    pub statuses: Mutex<Vec<JobState>>,
    pub completed: Mutex<Vec<JobResult>>,
    pub errors: Mutex<Vec<String>>,
    pub properties: Mutex<Vec<BTreeMap<String, String>>>,
    pub ignored: AtomicBool,
    pub stopped: AtomicBool,
    pub fail_reports: AtomicBool,
}

impl RecordingPublisher {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn has_line(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }

    pub fn statuses(&self) -> Vec<JobState> {
        self.statuses.lock().clone()
    }

    pub fn completed(&self) -> Vec<JobResult> {
        self.completed.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.fail_reports.load(Ordering::SeqCst) {
            Err(Error::Transport("server unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
    fn consume_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    async fn report_current_status(&self, state: JobState) -> Result<()> {
        self.check()?;
        self.statuses.lock().push(state);
        Ok(())
    }

    async fn report_completed(&self, result: JobResult) -> Result<()> {
        self.check()?;
        self.completed.lock().push(result);
        Ok(())
    }

    async fn report_error_message(&self, message: &str) -> Result<()> {
        self.check()?;
        self.errors.lock().push(message.to_string());
        Ok(())
    }

    async fn report_properties(&self, properties: &BTreeMap<String, String>) -> Result<()> {
        self.check()?;
        self.properties.lock().push(properties.clone());
        Ok(())
    }

    fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Step runner whose behaviour is scripted per step description.
#[derive(Default)]
pub struct ScriptedRunner {
    failing: HashSet<String>,
    blocking: HashMap<String, Arc<Notify>>,
    slow: HashMap<String, Duration>,
    offered: Mutex<Vec<(String, RunIfPolicy)>>,
    executed: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn failing(mut self, description: &str) -> Self {
        self.failing.insert(description.to_string());
        self
    }

    /// The step runs until [`ScriptedRunner::release`] is called for it.
    pub fn blocking(mut self, description: &str) -> Self {
        self.blocking
            .insert(description.to_string(), Arc::new(Notify::new()));
        self
    }

    pub fn slow(mut self, description: &str, delay: Duration) -> Self {
        self.slow.insert(description.to_string(), delay);
        self
    }

    pub fn release(&self, description: &str) {
        if let Some(gate) = self.blocking.get(description) {
            gate.notify_one();
        }
    }

    pub fn offered(&self) -> Vec<String> {
        self.offered.lock().iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn policies(&self) -> Vec<RunIfPolicy> {
        self.offered.lock().iter().map(|(_, p)| *p).collect()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn completed_count(&self, description: &str) -> usize {
        self.completed
            .lock()
            .iter()
            .filter(|d| d.as_str() == description)
            .count()
    }

    pub async fn wait_until_started(&self, description: &str) {
        for _ in 0..500 {
            if self.executed.lock().iter().any(|d| d == description) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("step '{}' never started", description);
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(&self, step: &BuildStep, current: RunIfPolicy, _ctx: &StepContext) -> Result<()> {
        let description = step.description();
        self.offered.lock().push((description.clone(), current));
        if !step.should_run(current) {
            return Ok(());
        }
        self.executed.lock().push(description.clone());

        if let Some(delay) = self.slow.get(&description) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(gate) = self.blocking.get(&description) {
            gate.notified().await;
        }
        self.completed.lock().push(description.clone());

        if self.failing.contains(&description) {
            Err(Error::StepFailed(format!("{} failed", description)))
        } else {
            Ok(())
        }
    }
}

/// Uploader that records every upload, failing for configured remote paths.
#[derive(Default)]
pub struct RecordingUploader {
    pub uploads: Mutex<Vec<(String, String)>>,
    pub contents: Mutex<HashMap<String, String>>,
    failing: HashSet<String>,
}

impl RecordingUploader {
    pub fn failing(mut self, remote_path: &str) -> Self {
        self.failing.insert(remote_path.to_string());
        self
    }

    pub fn remote_paths(&self) -> Vec<String> {
        self.uploads.lock().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl ArtifactUploader for RecordingUploader {
    async fn upload(&self, local: &Path, remote_path: &str, checksum: &str) -> Result<()> {
        if self.failing.contains(remote_path) {
            return Err(Error::Transport(format!("upload of {} rejected", remote_path)));
        }
        let content = std::fs::read_to_string(local).unwrap_or_default();
        self.contents.lock().insert(remote_path.to_string(), content);
        self.uploads
            .lock()
            .push((remote_path.to_string(), checksum.to_string()));
        Ok(())
    }
}

/// Extension recording each plugin call.
#[derive(Default)]
pub struct RecordingExtension {
    pub calls: Mutex<Vec<(String, BTreeMap<ArtifactStore, Vec<ArtifactPlan>>)>>,
    failing: HashSet<String>,
}

impl RecordingExtension {
    pub fn failing(mut self, plugin_id: &str) -> Self {
        self.failing.insert(plugin_id.to_string());
        self
    }
}

#[async_trait]
impl ArtifactExtension for RecordingExtension {
    async fn publish_artifact(
        &self,
        plugin_id: &str,
        artifacts: &BTreeMap<ArtifactStore, Vec<ArtifactPlan>>,
        _working_dir: &Path,
    ) -> Result<PluggableArtifactMetadata> {
        self.calls
            .lock()
            .push((plugin_id.to_string(), artifacts.clone()));
        if self.failing.contains(plugin_id) {
            return Err(Error::Internal(format!("plugin {} crashed", plugin_id)));
        }

        let mut metadata = PluggableArtifactMetadata::new();
        for plans in artifacts.values() {
            for plan in plans {
                if let ArtifactPlan::Pluggable { id, .. } = plan {
                    metadata.insert(id.clone(), serde_json::json!({ "published": true }));
                }
            }
        }
        Ok(metadata)
    }
}

/// Status reporter that records transitions, rejecting them as an unknown agent on demand.
#[derive(Default)]
pub struct RecordingReporter {
    pub statuses: Mutex<Vec<JobState>>,
    pub completed: Mutex<Vec<JobResult>>,
    pub properties: Mutex<Vec<BTreeMap<String, String>>>,
    pub reject_agent: AtomicBool,
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report_status(&self, _job: &JobIdentifier, state: JobState) -> Result<()> {
        if self.reject_agent.load(Ordering::SeqCst) {
            return Err(Error::InvalidAgent("agent is not registered".to_string()));
        }
        self.statuses.lock().push(state);
        Ok(())
    }

    async fn report_completed(&self, _job: &JobIdentifier, result: JobResult) -> Result<()> {
        if self.reject_agent.load(Ordering::SeqCst) {
            return Err(Error::InvalidAgent("agent is not registered".to_string()));
        }
        self.completed.lock().push(result);
        Ok(())
    }

    async fn report_properties(
        &self,
        _job: &JobIdentifier,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.reject_agent.load(Ordering::SeqCst) {
            return Err(Error::InvalidAgent("agent is not registered".to_string()));
        }
        self.properties.lock().push(properties.clone());
        Ok(())
    }
}

/// Material sync that records the revisions it was asked for.
#[derive(Default)]
pub struct RecordingMaterials {
    pub synced: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl MaterialSync for RecordingMaterials {
    async fn sync(
        &self,
        revisions: &[MaterialRevision],
        _working_dir: &Path,
        _publisher: &dyn JobPublisher,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("checkout failed".to_string()));
        }
        self.synced
            .lock()
            .extend(revisions.iter().map(|r| r.name.clone()));
        Ok(())
    }
}
