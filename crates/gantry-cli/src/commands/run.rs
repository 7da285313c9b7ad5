//! Local assignment execution command.

use anyhow::{Context, Result};
use gantry_config::{AgentConfig, parse_assignment};
use gantry_executor::LocalStepRunner;
use gantry_runtime::{
    AgentPublisher, ArtifactPublicationCoordinator, ConsoleRelay, JobLifecycleOrchestrator,
    JobOutcome, JobSettings, ServerClient,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::local::{NoArtifactPlugins, PreparedMaterials};

/// Run an assignment file with the local step runner, reporting to the configured server.
pub async fn run_assignment(
    path: &str,
    config_path: &str,
    server_url: Option<String>,
) -> Result<JobOutcome> {
    let mut config = AgentConfig::load(Path::new(config_path))
        .with_context(|| format!("Failed to load agent config: {}", config_path))?;
    if let Some(url) = server_url {
        config.server_url =
            Url::parse(&url).with_context(|| format!("Invalid server URL: {}", url))?;
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read assignment file: {}", path))?;
    let mut assignment = parse_assignment(&content)
        .with_context(|| format!("Failed to parse assignment: {}", path))?;
    assignment.working_dir = config.resolve_working_dir(&assignment.working_dir);

    info!(
        job = %assignment.job,
        agent = %config.agent_id,
        server = %config.server_url,
        working_dir = %assignment.working_dir.display(),
        "Running assignment"
    );

    let client = Arc::new(ServerClient::new(
        &config.server_url,
        config.agent_id,
        assignment.job.clone(),
    ));
    let relay = Arc::new(ConsoleRelay::start(client.clone(), &config.console));
    let publisher = Arc::new(AgentPublisher::new(
        assignment.job.clone(),
        relay,
        client.clone(),
    ));
    let runner = Arc::new(LocalStepRunner::new(client.clone()));
    let artifacts = ArtifactPublicationCoordinator::new(
        client.clone(),
        Arc::new(NoArtifactPlugins),
        publisher.clone(),
    );

    let orchestrator = Arc::new(JobLifecycleOrchestrator::new(
        assignment,
        runner,
        publisher.clone(),
        Arc::new(PreparedMaterials),
        artifacts,
        JobSettings {
            server_url: config.server_url.to_string(),
            initial_env: config.env.clone(),
            cancel_wait: config.cancel_wait,
        },
    ));

    let job = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    let interrupts = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, cancelling job (press Ctrl-C again to stop reporting)");
        orchestrator.cancel().await;

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, no longer reporting to the server");
            publisher.mark_ignored();
        }
    });

    let outcome = job.await.context("Job task failed")?;
    interrupts.abort();
    Ok(outcome)
}
