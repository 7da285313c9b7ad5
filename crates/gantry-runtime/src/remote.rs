//! HTTP client for the server's agent endpoints.

use async_trait::async_trait;
use gantry_core::artifact::{ArtifactFetcher, ArtifactUploader};
use gantry_core::publisher::StatusReporter;
use gantry_core::step::{JobResult, JobState};
use gantry_core::{AgentId, Error, JobIdentifier, Result};
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

use crate::console::ConsoleTransport;

/// Client for one job's traffic with the server.
pub struct ServerClient {
    client: reqwest::Client,
    base: String,
    agent_id: AgentId,
    job: JobIdentifier,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    agent_id: String,
    job_locator: String,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JobResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertiesReport<'a> {
    agent_id: String,
    job_locator: String,
    properties: &'a BTreeMap<String, String>,
}

impl ServerClient {
    pub fn new(server_url: &Url, agent_id: AgentId, job: JobIdentifier) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: server_url.as_str().trim_end_matches('/').to_string(),
            agent_id,
            job,
        }
    }

    fn console_url(&self) -> String {
        format!(
            "{}/remoting/files/{}/cruise-output/console.log?agentId={}",
            self.base,
            self.job.url_path(),
            self.agent_id
        )
    }

    fn status_url(&self, job: &JobIdentifier) -> String {
        format!("{}/remoting/jobs/{}/status", self.base, job.build_id)
    }

    fn properties_url(&self, job: &JobIdentifier) -> String {
        format!("{}/remoting/jobs/{}/properties", self.base, job.build_id)
    }

    fn artifact_url(&self, locator: &str, remote_path: &str) -> String {
        format!(
            "{}/remoting/files/{}/{}",
            self.base,
            locator.trim_matches('/'),
            remote_path.trim_start_matches('/')
        )
    }

    async fn post_status(
        &self,
        job: &JobIdentifier,
        state: JobState,
        result: Option<JobResult>,
    ) -> Result<()> {
        let report = StatusReport {
            agent_id: self.agent_id.to_string(),
            job_locator: job.to_string(),
            state,
            result,
        };

        let response = self
            .client
            .post(self.status_url(job))
            .json(&report)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        check_status(response, "report status").await
    }
}

async fn check_status(response: reqwest::Response, action: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    if status == StatusCode::FORBIDDEN {
        return Err(Error::InvalidAgent(format!(
            "server refused to {}: {}",
            action, text
        )));
    }
    Err(Error::Transport(format!(
        "Failed to {} ({}): {}",
        action, status, text
    )))
}

#[async_trait]
impl ConsoleTransport for ServerClient {
    async fn append(&self, content: String) -> Result<()> {
        let length = content.len();
        let response = self
            .client
            .put(self.console_url())
            .header(CONTENT_LENGTH, length)
            .body(content)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        check_status(response, "append console output").await
    }
}

#[async_trait]
impl StatusReporter for ServerClient {
    async fn report_status(&self, job: &JobIdentifier, state: JobState) -> Result<()> {
        self.post_status(job, state, None).await
    }

    async fn report_completed(&self, job: &JobIdentifier, result: JobResult) -> Result<()> {
        self.post_status(job, JobState::Completed, Some(result))
            .await
    }

    async fn report_properties(
        &self,
        job: &JobIdentifier,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        let report = PropertiesReport {
            agent_id: self.agent_id.to_string(),
            job_locator: job.to_string(),
            properties,
        };

        let response = self
            .client
            .post(self.properties_url(job))
            .json(&report)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        check_status(response, "report build properties").await
    }
}

#[async_trait]
impl ArtifactUploader for ServerClient {
    async fn upload(&self, local: &Path, remote_path: &str, checksum: &str) -> Result<()> {
        let body = tokio::fs::read(local).await?;
        let url = self.artifact_url(&self.job.url_path(), remote_path);
        debug!(url = %url, bytes = body.len(), "Uploading artifact");

        let response = self
            .client
            .put(&url)
            .header(CONTENT_LENGTH, body.len())
            .header("X-Checksum", checksum)
            .query(&[("agentId", self.agent_id.to_string())])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        check_status(response, &format!("upload {}", remote_path)).await
    }
}

#[async_trait]
impl ArtifactFetcher for ServerClient {
    async fn fetch(&self, job: &str, source: &str, destination: &Path) -> Result<()> {
        let locator: JobIdentifier = job.parse()?;
        let url = self.artifact_url(&locator.url_path(), source);

        let response = self
            .client
            .get(&url)
            .query(&[("agentId", self.agent_id.to_string())])
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("artifact [{}] of [{}]", source, job)));
        }
        if !response.status().is_success() {
            let status = response.status();
            warn!(url = %url, status = %status, "Artifact fetch failed");
            return check_status(response, &format!("fetch {}", source)).await;
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let file_name = Path::new(source)
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("artifact source [{}] names no file", source)))?;
        tokio::fs::create_dir_all(destination).await?;
        tokio::fs::write(destination.join(file_name), &bytes).await?;
        Ok(())
    }
}
