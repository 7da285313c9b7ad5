//! The step runner used when the agent executes work on its own host.

use async_trait::async_trait;
use gantry_core::artifact::ArtifactFetcher;
use gantry_core::step::{BuildStep, RunIfPolicy, StepContext, StepKind, StepRunner};
use gantry_core::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::process::{ProcessRegistry, ProcessSpec, run_process};

/// Runs every [`StepKind`] on the local machine.
pub struct LocalStepRunner {
    processes: Arc<ProcessRegistry>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl LocalStepRunner {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            processes: Arc::new(ProcessRegistry::new()),
            fetcher,
        }
    }

    /// Processes started by command steps that are still running.
    pub fn processes(&self) -> Arc<ProcessRegistry> {
        self.processes.clone()
    }

    async fn dispatch(&self, step: &BuildStep, ctx: &StepContext) -> Result<()> {
        match &step.kind {
            StepKind::Command {
                command,
                args,
                working_dir,
            } => {
                let dir = match working_dir {
                    Some(sub) => ctx.working_dir.join(sub),
                    None => ctx.working_dir.clone(),
                };
                if !dir.is_dir() {
                    return Err(Error::StepFailed(format!(
                        "Working directory \"{}\" does not exist",
                        dir.display()
                    )));
                }
                run_process(
                    ProcessSpec {
                        command,
                        args,
                        working_dir: &dir,
                        env: &ctx.env,
                        secrets: &ctx.secrets,
                    },
                    ctx.publisher.clone(),
                    &self.processes,
                )
                .await
            }
            StepKind::FetchArtifact {
                job,
                source,
                destination,
            } => {
                let dest = ctx.working_dir.join(destination);
                self.fetcher.fetch(job, source, &dest).await
            }
            StepKind::KillAllChildren => {
                let killed = self.processes.kill_all();
                ctx.publisher
                    .report_action(&format!("Killed {} running process(es)", killed));
                Ok(())
            }
            StepKind::Noop => Ok(()),
        }
    }
}

#[async_trait]
impl StepRunner for LocalStepRunner {
    async fn run(&self, step: &BuildStep, current: RunIfPolicy, ctx: &StepContext) -> Result<()> {
        let description = ctx.secrets.mask(&step.description());
        ctx.publisher
            .report_action(&format!("Current job status: {}", current));

        if !step.should_run(current) {
            debug!(step = %description, run_if = %step.run_if, "Skipping step");
            ctx.publisher.report_action(&format!(
                "Skipping task: {} (runs if {})",
                description, step.run_if
            ));
            return Ok(());
        }

        info!(step = %description, "Running step");
        ctx.publisher.report_action(&format!("Task: {}", description));

        let started = Instant::now();
        let result = self.dispatch(step, ctx).await;
        let elapsed = started.elapsed().as_millis();

        match &result {
            Ok(()) => {
                ctx.publisher
                    .report_action(&format!("Task status: passed ({} ms)", elapsed));
            }
            Err(e) => {
                let message = ctx.secrets.mask(&e.to_string());
                warn!(step = %description, error = %message, "Step failed");
                ctx.publisher.consume_line(&message);
                ctx.publisher
                    .report_action(&format!("Task status: failed ({} ms)", elapsed));
            }
        }

        result
    }
}
