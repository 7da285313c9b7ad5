//! Ordered step execution with cooperative cancellation.
//!
//! Every step is offered to the runner in declared order. A step failure
//! degrades the accumulated result to failed but never stops the loop, so
//! later cleanup steps still get to decide from their own run-if policies.
//! Only a cancel request ends the sequence early.

use gantry_core::step::{BuildStep, JobResult, RunIfConfig, RunIfPolicy, StepContext, StepRunner};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelState {
    Idle,
    Running,
    Finished,
}

/// Runs a job's build steps and coordinates an out-of-band cancel.
pub struct StepSequencer {
    steps: Vec<BuildStep>,
    runner: Arc<dyn StepRunner>,
    /// Index of the step currently executing. The last step stays current after it finishes.
    current: Mutex<Option<usize>>,
    cancel_requested: AtomicBool,
    cancel_state: watch::Sender<CancelState>,
    cancel_wait: Duration,
}

impl StepSequencer {
    pub fn new(steps: Vec<BuildStep>, runner: Arc<dyn StepRunner>, cancel_wait: Duration) -> Self {
        let (cancel_state, _) = watch::channel(CancelState::Idle);
        Self {
            steps,
            runner,
            current: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            cancel_state,
            cancel_wait,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Run every step in order and return the job result.
    pub async fn execute(&self, ctx: &StepContext) -> JobResult {
        let mut accumulated = JobResult::Passed;

        for (index, step) in self.steps.iter().enumerate() {
            {
                let mut current = self.current.lock().await;
                if self.is_cancelled() {
                    info!(step = index + 1, "Cancel requested, not running remaining steps");
                    break;
                }
                *current = Some(index);
            }

            debug!(step = index + 1, run_if = %step.run_if, result = %accumulated, "Offering step");
            if let Err(e) = self
                .runner
                .run(step, RunIfPolicy::from(accumulated), ctx)
                .await
            {
                warn!(step = index + 1, error = %e, "Step failed");
                accumulated = JobResult::Failed;
            }
        }

        if self.is_cancelled() {
            JobResult::Cancelled
        } else {
            accumulated
        }
    }

    /// Request cancellation and run the current step's on-cancel hook.
    ///
    /// Returns once the hook has finished. Only the first call has any effect.
    pub async fn cancel(&self, ctx: &StepContext) {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            debug!("Cancel already requested");
            return;
        }
        self.cancel_state.send_replace(CancelState::Running);

        {
            let current = self.current.lock().await;
            let hook = (*current)
                .and_then(|index| self.steps.get(index))
                .and_then(|step| step.on_cancel.as_deref());

            if let Some(hook) = hook {
                let hook = hook.clone().with_run_if(RunIfConfig::any());
                let description = ctx.secrets.mask(&hook.description());
                info!(hook = %description, "Running on-cancel task");
                ctx.publisher
                    .report_action(&format!("On Cancel Task: {}", description));
                if let Err(e) = self.runner.run(&hook, RunIfPolicy::Failed, ctx).await {
                    warn!(error = %e, "On-cancel task failed");
                }
                ctx.publisher.report_action("On Cancel Task completed");
            }
        }

        self.cancel_state.send_replace(CancelState::Finished);
    }

    /// Wait for an in-flight cancel to finish, bounded by the configured wait.
    ///
    /// Returns `false` if the wait timed out.
    pub async fn await_cancel_completion(&self) -> bool {
        let mut rx = self.cancel_state.subscribe();
        if *rx.borrow() == CancelState::Idle {
            return true;
        }

        match tokio::time::timeout(
            self.cancel_wait,
            rx.wait_for(|state| *state == CancelState::Finished),
        )
        .await
        {
            Ok(_) => true,
            Err(_) => {
                warn!(wait = ?self.cancel_wait, "Timed out waiting for cancel to finish");
                false
            }
        }
    }
}
