//! CLI command implementations.

pub mod local;
pub mod run;

use anyhow::Result;

pub fn validate(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    match gantry_config::parse_assignment(&content) {
        Ok(assignment) => {
            println!(
                "Assignment for {} is valid ({} steps, {} artifacts)",
                assignment.job,
                assignment.steps.len(),
                assignment.artifact_plans.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Assignment error: {}", e);
            std::process::exit(1);
        }
    }
}
