//! Error types for the agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("{0}")]
    ArtifactUpload(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The server no longer recognises this agent (its identity changed mid-build).
    #[error("invalid agent: {0}")]
    InvalidAgent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_invalid_agent(&self) -> bool {
        matches!(self, Error::InvalidAgent(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
