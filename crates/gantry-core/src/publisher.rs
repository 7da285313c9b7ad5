//! Publisher and status-reporting seams.
//!
//! The publisher is the only way the job talks back to the server: console
//! lines, status transitions, the final result and error reports.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::Result;
use crate::id::JobIdentifier;
use crate::step::{JobResult, JobState};

/// Prefix for lines the agent itself writes to the console.
pub const AGENT_TAG: &str = "[gantry]";

/// Sink for everything a running job reports.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Queue one console line. Never blocks on the network.
    fn consume_line(&self, line: &str);

    /// Queue a console line tagged as coming from the agent.
    fn report_action(&self, action: &str) {
        self.consume_line(&format!("{} {}", AGENT_TAG, action));
    }

    async fn report_current_status(&self, state: JobState) -> Result<()>;

    async fn report_completed(&self, result: JobResult) -> Result<()>;

    async fn report_error_message(&self, message: &str) -> Result<()>;

    /// Send the build properties harvested after the steps ran.
    async fn report_properties(&self, properties: &BTreeMap<String, String>) -> Result<()>;

    /// Whether the server has already given up on this job.
    fn is_ignored(&self) -> bool;

    /// Flush outstanding console output and stop background shipping.
    async fn stop(&self);
}

/// Remote endpoint receiving job status transitions.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report_status(&self, job: &JobIdentifier, state: JobState) -> Result<()>;

    async fn report_completed(&self, job: &JobIdentifier, result: JobResult) -> Result<()>;

    async fn report_properties(
        &self,
        job: &JobIdentifier,
        properties: &BTreeMap<String, String>,
    ) -> Result<()>;
}
