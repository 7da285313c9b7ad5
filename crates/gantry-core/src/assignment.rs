//! Work assignments as dispatched by the server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::artifact::{ArtifactPlan, ArtifactStore};
use crate::environment::{EnvironmentContext, EnvironmentVariable};
use crate::id::JobIdentifier;
use crate::material::MaterialRevision;
use crate::step::{BuildStep, StepKind};
use crate::{Error, Result};

/// Directory under the working directory holding agent-produced build output.
pub const OUTPUT_DIR: &str = "cruise-output";

/// A build property extracted from a file once the steps have run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySource {
    pub name: String,
    /// File relative to the working directory.
    pub source: String,
    /// Regular expression whose first capture group is the value.
    pub pattern: String,
}

/// One unit of build work dispatched from the server to this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    pub job: JobIdentifier,
    /// Steps, in execution order.
    pub steps: Vec<BuildStep>,
    pub working_dir: PathBuf,
    pub materials: Vec<MaterialRevision>,
    /// Variables defined on the job itself.
    pub env: EnvironmentContext,
    /// User who triggered the run.
    pub approver: Option<String>,
    pub artifact_plans: Vec<ArtifactPlan>,
    pub artifact_stores: Vec<ArtifactStore>,
    pub properties: Vec<PropertySource>,
    pub fetch_materials: bool,
    pub clean_working_dir: bool,
}

impl WorkAssignment {
    pub fn new(job: JobIdentifier, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            job,
            steps: Vec::new(),
            working_dir: working_dir.into(),
            materials: Vec::new(),
            env: EnvironmentContext::new(),
            approver: None,
            artifact_plans: Vec::new(),
            artifact_stores: Vec::new(),
            properties: Vec::new(),
            fetch_materials: true,
            clean_working_dir: false,
        }
    }

    /// Append a variable to the job environment before execution starts.
    pub fn enhance_environment(&mut self, var: EnvironmentVariable) {
        self.env.set(var);
    }

    pub fn store(&self, id: &str) -> Option<&ArtifactStore> {
        self.artifact_stores.iter().find(|s| s.id == id)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.working_dir.join(OUTPUT_DIR)
    }

    /// Check references the server should already have validated.
    pub fn validate(&self) -> Result<()> {
        for plan in &self.artifact_plans {
            if let ArtifactPlan::Pluggable { id, store_id, .. } = plan {
                if self.store(store_id).is_none() {
                    return Err(Error::InvalidInput(format!(
                        "artifact '{}' refers to unknown store '{}'",
                        id, store_id
                    )));
                }
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            validate_step(step).map_err(|message| {
                Error::InvalidInput(format!("step {}: {}", index + 1, message))
            })?;
        }

        Ok(())
    }
}

fn validate_step(step: &BuildStep) -> std::result::Result<(), String> {
    if let StepKind::Command { command, .. } = &step.kind {
        if command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
    }
    match &step.on_cancel {
        Some(on_cancel) => validate_step(on_cancel).map_err(|m| format!("on-cancel {}", m)),
        None => Ok(()),
    }
}
