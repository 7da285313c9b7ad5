//! Agent and job identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Identity the agent presents to the server.
/// Uses UUIDv7 when freshly generated so registrations sort by time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a new unique AgentId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AgentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Locates one job instance on the server.
///
/// Displays as the slash-separated locator used in server URLs:
/// `pipeline/label/stage/stage_counter/job`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{pipeline_name}/{pipeline_label}/{stage_name}/{stage_counter}/{job_name}")]
pub struct JobIdentifier {
    pub pipeline_name: String,
    pub pipeline_label: String,
    pub stage_name: String,
    pub stage_counter: String,
    pub job_name: String,
    /// Server-side build id, used for status reporting.
    pub build_id: i64,
}

impl JobIdentifier {
    /// Locator with every segment percent-encoded, ready to splice into a URL path.
    pub fn url_path(&self) -> String {
        [
            &self.pipeline_name,
            &self.pipeline_label,
            &self.stage_name,
            &self.stage_counter,
            &self.job_name,
        ]
        .iter()
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
    }
}

impl std::str::FromStr for JobIdentifier {
    type Err = Error;

    /// Parse a locator of the form `pipeline/label/stage/counter/job`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [pipeline, label, stage, counter, job] if parts.iter().all(|p| !p.is_empty()) => {
                Ok(Self {
                    pipeline_name: pipeline.to_string(),
                    pipeline_label: label.to_string(),
                    stage_name: stage.to_string(),
                    stage_counter: counter.to_string(),
                    job_name: job.to_string(),
                    build_id: 0,
                })
            }
            _ => Err(Error::InvalidInput(format!(
                "job locator must look like pipeline/label/stage/counter/job, got '{}'",
                s
            ))),
        }
    }
}
