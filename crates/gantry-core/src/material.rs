//! Material revisions and the checkout seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;
use crate::publisher::JobPublisher;

/// The revision of one material (repository) a job builds against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRevision {
    /// Material name, unique within the assignment.
    pub name: String,
    /// Material type, e.g. "git".
    pub kind: String,
    pub url: String,
    pub revision: String,
    /// Checkout directory relative to the working directory.
    pub destination: Option<String>,
}

impl MaterialRevision {
    /// Name of the environment variable exposing this revision to steps.
    pub fn env_var_name(&self) -> String {
        let suffix: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("GANTRY_REVISION_{}", suffix)
    }
}

/// Brings the working directory to the assigned material revisions.
#[async_trait]
pub trait MaterialSync: Send + Sync {
    async fn sync(
        &self,
        revisions: &[MaterialRevision],
        working_dir: &Path,
        publisher: &dyn JobPublisher,
    ) -> Result<()>;
}
