//! Build steps, run-if policies and job results.
//!
//! A job is an ordered list of [`BuildStep`]s. Every step is offered to the
//! [`StepRunner`] exactly once; the step's own [`RunIfConfig`] decides whether
//! it actually performs work given the result accumulated so far.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::Result;
use crate::environment::SecretMask;
use crate::publisher::JobPublisher;

/// Outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    #[display("passed")]
    Passed,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

/// Lifecycle states reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum JobState {
    Preparing,
    Building,
    Completing,
    Completed,
}

/// Condition under which a step performs work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum RunIfPolicy {
    #[display("passed")]
    Passed,
    #[display("failed")]
    Failed,
    #[display("any")]
    Any,
}

impl From<JobResult> for RunIfPolicy {
    /// The policy a step is evaluated against. The accumulated result is
    /// never `Cancelled` while steps are running; should it be, cleanup steps
    /// see it as a failure.
    fn from(result: JobResult) -> Self {
        match result {
            JobResult::Passed => RunIfPolicy::Passed,
            JobResult::Failed | JobResult::Cancelled => RunIfPolicy::Failed,
        }
    }
}

impl std::str::FromStr for RunIfPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "passed" => Ok(RunIfPolicy::Passed),
            "failed" => Ok(RunIfPolicy::Failed),
            "any" => Ok(RunIfPolicy::Any),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown run-if status '{}'",
                other
            ))),
        }
    }
}

/// The set of policies a step runs under. Empty means `passed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIfConfig(Vec<RunIfPolicy>);

impl RunIfConfig {
    pub fn new(policies: impl IntoIterator<Item = RunIfPolicy>) -> Self {
        let mut list: Vec<RunIfPolicy> = Vec::new();
        for policy in policies {
            if !list.contains(&policy) {
                list.push(policy);
            }
        }
        Self(list)
    }

    pub fn any() -> Self {
        Self(vec![RunIfPolicy::Any])
    }

    pub fn policies(&self) -> Vec<RunIfPolicy> {
        if self.0.is_empty() {
            vec![RunIfPolicy::Passed]
        } else {
            self.0.clone()
        }
    }

    /// Whether a step with this configuration acts when the job is `current`.
    pub fn matches(&self, current: RunIfPolicy) -> bool {
        self.policies()
            .iter()
            .any(|p| *p == RunIfPolicy::Any || *p == current)
    }
}

impl std::fmt::Display for RunIfConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.policies().iter().map(|p| p.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    /// Run an external command.
    Command {
        command: String,
        args: Vec<String>,
        /// Directory relative to the job's working directory.
        working_dir: Option<String>,
    },
    /// Download an artifact published by an upstream job.
    FetchArtifact {
        /// Locator of the job that published the artifact.
        job: String,
        source: String,
        destination: String,
    },
    /// Terminate every child process started by this job.
    KillAllChildren,
    /// Nothing to do.
    Noop,
}

/// One executable unit within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub kind: StepKind,
    pub run_if: RunIfConfig,
    /// Step run when the job is cancelled while this step is current.
    pub on_cancel: Option<Box<BuildStep>>,
}

impl BuildStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            run_if: RunIfConfig::default(),
            on_cancel: None,
        }
    }

    pub fn command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(StepKind::Command {
            command: command.into(),
            args,
            working_dir: None,
        })
    }

    pub fn noop() -> Self {
        Self::new(StepKind::Noop)
    }

    pub fn with_run_if(mut self, run_if: RunIfConfig) -> Self {
        self.run_if = run_if;
        self
    }

    pub fn with_on_cancel(mut self, step: BuildStep) -> Self {
        self.on_cancel = Some(Box::new(step));
        self
    }

    pub fn should_run(&self, current: RunIfPolicy) -> bool {
        self.run_if.matches(current)
    }

    /// Human readable summary used in console output.
    pub fn description(&self) -> String {
        match &self.kind {
            StepKind::Command { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            StepKind::FetchArtifact {
                job,
                source,
                destination,
            } => format!("fetch artifact [{}] => [{}] from [{}]", source, destination, job),
            StepKind::KillAllChildren => "kill all child processes".to_string(),
            StepKind::Noop => "no-op".to_string(),
        }
    }
}

/// Everything a step needs from the job that runs it.
#[derive(Clone)]
pub struct StepContext {
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    /// Applied to everything a step writes to the console.
    pub secrets: SecretMask,
    pub publisher: Arc<dyn JobPublisher>,
}

/// Executes individual build steps.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `step` given the job's current status.
    ///
    /// Implementations decide from the step's own run-if configuration
    /// whether to act; a skipped step returns `Ok(())`.
    async fn run(&self, step: &BuildStep, current: RunIfPolicy, ctx: &StepContext) -> Result<()>;
}
