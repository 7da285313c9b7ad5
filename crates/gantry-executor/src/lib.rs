//! Local step execution for the Gantry build agent.
//!
//! Provides the [`StepRunner`](gantry_core::step::StepRunner) used when the
//! agent runs work on its own host:
//! - shell commands, with output streamed to the job console
//! - artifact fetches from upstream jobs
//! - killing every child process the job started

pub mod process;
pub mod runner;

pub use process::ProcessRegistry;
pub use runner::LocalStepRunner;
