//! Build properties extracted from files the steps produced.

use gantry_core::assignment::PropertySource;
use gantry_core::publisher::JobPublisher;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Read each source file and capture its property value.
///
/// A missing file or a pattern without a match is reported on the console
/// and skipped; it never fails the job.
pub async fn harvest_properties(
    working_dir: &Path,
    sources: &[PropertySource],
    publisher: &dyn JobPublisher,
) -> BTreeMap<String, String> {
    let mut harvested = BTreeMap::new();

    for source in sources {
        match harvest_one(working_dir, source).await {
            Ok(value) => {
                debug!(property = %source.name, value = %value, "Harvested build property");
                publisher.report_action(&format!(
                    "Setting build property {} to {}",
                    source.name, value
                ));
                harvested.insert(source.name.clone(), value);
            }
            Err(reason) => {
                warn!(property = %source.name, reason = %reason, "Could not harvest build property");
                publisher.report_action(&format!(
                    "Failed to set build property {}: {}",
                    source.name, reason
                ));
            }
        }
    }

    harvested
}

async fn harvest_one(working_dir: &Path, source: &PropertySource) -> Result<String, String> {
    let pattern = Regex::new(&source.pattern)
        .map_err(|e| format!("invalid pattern '{}': {}", source.pattern, e))?;
    let path = working_dir.join(&source.source);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| format!("cannot read {}: {}", source.source, e))?;

    pattern
        .captures(&content)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            format!(
                "pattern '{}' did not match anything in {}",
                source.pattern, source.source
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPublisher;

    fn source(name: &str, file: &str, pattern: &str) -> PropertySource {
        PropertySource {
            name: name.to_string(),
            source: file.to_string(),
            pattern: pattern.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_capture_group_is_the_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("coverage.txt"), "lines: 10\ntotal: 87%\n").unwrap();
        let publisher = RecordingPublisher::default();

        let props = harvest_properties(
            dir.path(),
            &[source("coverage", "coverage.txt", r"total: (\d+)%")],
            &publisher,
        )
        .await;

        assert_eq!(props["coverage"], "87");
        assert!(publisher.has_line("[gantry] Setting build property coverage to 87"));
    }

    #[tokio::test]
    async fn test_missing_file_and_no_match_are_reported_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "nothing here").unwrap();
        let publisher = RecordingPublisher::default();

        let props = harvest_properties(
            dir.path(),
            &[
                source("missing", "absent.txt", "(.*)"),
                source("unmatched", "out.txt", r"version=(\S+)"),
            ],
            &publisher,
        )
        .await;

        assert!(props.is_empty());
        assert!(publisher.has_line("Failed to set build property missing: cannot read absent.txt"));
        assert!(publisher.has_line("Failed to set build property unmatched: pattern"));
    }
}
