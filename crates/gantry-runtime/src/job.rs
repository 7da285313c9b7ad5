//! Job lifecycle: prepare, build, complete, report.

use gantry_core::assignment::WorkAssignment;
use gantry_core::environment::{EnvironmentContext, EnvironmentVariable};
use gantry_core::material::MaterialSync;
use gantry_core::publisher::JobPublisher;
use gantry_core::step::{JobResult, JobState, StepContext, StepRunner};
use gantry_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactPublicationCoordinator;
use crate::properties::harvest_properties;
use crate::sequencer::StepSequencer;

/// How a job run ended, from the agent's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The final state reached the server. `None` when the job was ignored
    /// and only its completion was reported.
    Finished(Option<JobResult>),
    /// Reporting broke down or the server no longer knows this agent.
    Abandoned,
}

/// Agent-level inputs to a job run.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub server_url: String,
    /// Variables every job on this agent starts with.
    pub initial_env: EnvironmentContext,
    pub cancel_wait: Duration,
}

/// Drives one [`WorkAssignment`] from preparation to its reported result.
pub struct JobLifecycleOrchestrator {
    assignment: WorkAssignment,
    publisher: Arc<dyn JobPublisher>,
    materials: Arc<dyn MaterialSync>,
    artifacts: ArtifactPublicationCoordinator,
    sequencer: StepSequencer,
    settings: JobSettings,
    /// Context handed to on-cancel hooks; holds the full environment once prepared.
    step_context: parking_lot::Mutex<StepContext>,
}

impl JobLifecycleOrchestrator {
    pub fn new(
        assignment: WorkAssignment,
        runner: Arc<dyn StepRunner>,
        publisher: Arc<dyn JobPublisher>,
        materials: Arc<dyn MaterialSync>,
        artifacts: ArtifactPublicationCoordinator,
        settings: JobSettings,
    ) -> Self {
        let sequencer = StepSequencer::new(assignment.steps.clone(), runner, settings.cancel_wait);
        let step_context = StepContext {
            working_dir: assignment.working_dir.clone(),
            env: assignment.env.to_map(),
            secrets: assignment.env.secrets(),
            publisher: publisher.clone(),
        };
        Self {
            assignment,
            publisher,
            materials,
            artifacts,
            sequencer,
            settings,
            step_context: parking_lot::Mutex::new(step_context),
        }
    }

    /// Cancel the running job, returning once the current step's on-cancel hook is done.
    pub async fn cancel(&self) {
        info!(job = %self.assignment.job, "Cancelling job");
        let ctx = self.step_context.lock().clone();
        self.sequencer.cancel(&ctx).await;
    }

    /// Run the job to completion.
    pub async fn run(&self) -> JobOutcome {
        let job = &self.assignment.job;

        if self.publisher.is_ignored() {
            info!(job = %job, "Job is ignored, reporting completion only");
            let outcome = match self
                .publisher
                .report_current_status(JobState::Completed)
                .await
            {
                Ok(()) => JobOutcome::Finished(None),
                Err(e) => {
                    error!(job = %job, error = %e, "Failed to report completion of ignored job");
                    JobOutcome::Abandoned
                }
            };
            self.publisher.stop().await;
            return outcome;
        }

        let phases = self.run_phases().await;
        self.sequencer.await_cancel_completion().await;

        let outcome = match phases {
            Ok(result) => self.report_result(result).await,
            Err(e) if e.is_invalid_agent() => {
                error!(job = %job, error = %e, "Agent is no longer recognised, abandoning job");
                JobOutcome::Abandoned
            }
            Err(e) => self.report_failure(&e).await,
        };

        self.publisher.stop().await;
        info!(job = %job, outcome = ?outcome, "Job finished");
        outcome
    }

    async fn run_phases(&self) -> Result<JobResult> {
        let job = &self.assignment.job;

        self.publisher
            .report_current_status(JobState::Preparing)
            .await?;
        self.publisher
            .report_action(&format!("Start to prepare {}", job));
        let env = self.prepare().await?;

        if self.publisher.is_ignored() {
            info!(job = %job, "Job was ignored during preparation");
            return Ok(JobResult::Cancelled);
        }

        let ctx = StepContext {
            working_dir: self.assignment.working_dir.clone(),
            env: env.to_map(),
            secrets: env.secrets(),
            publisher: self.publisher.clone(),
        };
        *self.step_context.lock() = ctx.clone();

        self.publisher
            .report_current_status(JobState::Building)
            .await?;
        self.publisher.report_action(&format!("Start to build {}", job));
        let mut result = self.sequencer.execute(&ctx).await;
        self.publisher
            .report_action(&format!("Current job status: {}", result));

        if result == JobResult::Cancelled || self.publisher.is_ignored() {
            return Ok(result);
        }

        self.publisher
            .report_current_status(JobState::Completing)
            .await?;
        self.publisher.report_action(&format!("Start to upload {}", job));

        let properties = harvest_properties(
            &self.assignment.working_dir,
            &self.assignment.properties,
            self.publisher.as_ref(),
        )
        .await;
        if !properties.is_empty() {
            self.publisher.report_properties(&properties).await?;
        }

        if let Err(e) = self
            .artifacts
            .publish(
                &self.assignment.working_dir,
                &self.assignment.artifact_plans,
                &self.assignment.artifact_stores,
            )
            .await
        {
            warn!(job = %job, error = %e, "Artifact publication failed");
            self.publisher.report_action(&e.to_string());
            result = JobResult::Failed;
        }

        Ok(result)
    }

    async fn prepare(&self) -> Result<EnvironmentContext> {
        let dir = &self.assignment.working_dir;

        if self.assignment.clean_working_dir && dir.exists() {
            self.publisher
                .report_action(&format!("Cleaning working directory \"{}\"", dir.display()));
            tokio::fs::remove_dir_all(dir).await?;
        }
        if !dir.is_dir() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Internal(format!(
                    "Failed to create working directory \"{}\": {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        if self.assignment.fetch_materials {
            self.publisher.report_action("Start to update materials.");
            self.materials
                .sync(&self.assignment.materials, dir, self.publisher.as_ref())
                .await?;
        } else {
            self.publisher.report_action(
                "Skipping material update since stage is configured not to fetch materials",
            );
        }

        Ok(self.build_environment())
    }

    /// Agent variables, then the standard job variables, then the job's own.
    fn build_environment(&self) -> EnvironmentContext {
        let publisher = self.publisher.as_ref();
        let job = &self.assignment.job;
        let mut env = EnvironmentContext::new();
        env.apply_reported(&self.settings.initial_env, publisher);

        let standard = [
            ("GANTRY_SERVER_URL", self.settings.server_url.clone()),
            ("GANTRY_PIPELINE_NAME", job.pipeline_name.clone()),
            ("GANTRY_PIPELINE_LABEL", job.pipeline_label.clone()),
            ("GANTRY_STAGE_NAME", job.stage_name.clone()),
            ("GANTRY_STAGE_COUNTER", job.stage_counter.clone()),
            ("GANTRY_JOB_NAME", job.job_name.clone()),
        ];
        for (name, value) in standard {
            env.set_reported(EnvironmentVariable::plain(name, value), publisher);
        }
        if let Some(approver) = &self.assignment.approver {
            env.set_reported(
                EnvironmentVariable::plain("GANTRY_TRIGGER_USER", approver.clone()),
                publisher,
            );
        }
        for material in &self.assignment.materials {
            env.set_reported(
                EnvironmentVariable::plain(material.env_var_name(), material.revision.clone()),
                publisher,
            );
        }

        env.apply_reported(&self.assignment.env, publisher);
        env
    }

    async fn report_result(&self, result: JobResult) -> JobOutcome {
        let job = &self.assignment.job;
        let reported = if self.publisher.is_ignored() {
            self.publisher
                .report_current_status(JobState::Completed)
                .await
                .map(|()| None)
        } else {
            self.publisher
                .report_completed(result)
                .await
                .map(|()| Some(result))
        };

        match reported {
            Ok(result) => JobOutcome::Finished(result),
            Err(e) => {
                error!(job = %job, error = %e, "Failed to report job result, abandoning job");
                JobOutcome::Abandoned
            }
        }
    }

    /// Report an error that escaped the job phases and force the job to failed.
    async fn report_failure(&self, cause: &Error) -> JobOutcome {
        let job = &self.assignment.job;
        error!(job = %job, error = %cause, "Job failed");

        let message = format!("Job {} failed: {}", job, cause);
        let reported = match self.publisher.report_error_message(&message).await {
            Ok(()) => self.publisher.report_completed(JobResult::Failed).await,
            Err(e) => Err(e),
        };

        match reported {
            Ok(()) => JobOutcome::Finished(Some(JobResult::Failed)),
            Err(e) => {
                error!(job = %job, error = %e, "Failed to report job failure, abandoning job");
                JobOutcome::Abandoned
            }
        }
    }
}
