//! The publisher a job reports through when running under the agent.

use async_trait::async_trait;
use chrono::Local;
use gantry_core::publisher::{JobPublisher, StatusReporter};
use gantry_core::step::{JobResult, JobState};
use gantry_core::{JobIdentifier, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

use crate::console::ConsoleRelay;

/// Console lines go to a [`ConsoleRelay`]; status transitions go straight to the server.
pub struct AgentPublisher {
    job: JobIdentifier,
    relay: Arc<ConsoleRelay>,
    reporter: Arc<dyn StatusReporter>,
    ignored: AtomicBool,
}

impl AgentPublisher {
    pub fn new(
        job: JobIdentifier,
        relay: Arc<ConsoleRelay>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            job,
            relay,
            reporter,
            ignored: AtomicBool::new(false),
        }
    }

    /// Stop reporting this job's progress; it is no longer tracked by the server.
    pub fn mark_ignored(&self) {
        if !self.ignored.swap(true, Ordering::SeqCst) {
            info!(job = %self.job, "Job marked as ignored");
        }
    }
}

#[async_trait]
impl JobPublisher for AgentPublisher {
    fn consume_line(&self, line: &str) {
        let stamp = Local::now().format("%H:%M:%S%.3f");
        self.relay.consume_line(format!("{} {}", stamp, line));
    }

    async fn report_current_status(&self, state: JobState) -> Result<()> {
        info!(job = %self.job, state = %state, "Reporting job status");
        self.reporter.report_status(&self.job, state).await
    }

    async fn report_completed(&self, result: JobResult) -> Result<()> {
        info!(job = %self.job, result = %result, "Reporting job completed");
        self.reporter.report_completed(&self.job, result).await
    }

    async fn report_error_message(&self, message: &str) -> Result<()> {
        error!(job = %self.job, "{}", message);
        self.consume_line(message);
        Ok(())
    }

    async fn report_properties(&self, properties: &BTreeMap<String, String>) -> Result<()> {
        info!(job = %self.job, count = properties.len(), "Reporting build properties");
        self.reporter.report_properties(&self.job, properties).await
    }

    fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.relay.stop().await;
    }
}
