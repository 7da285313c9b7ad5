//! Job runtime for the Gantry build agent.
//!
//! Runs one work assignment end to end: steps in order with cooperative
//! cancellation, console output shipped in the background, artifacts
//! published in two phases, and every state transition reported to the
//! server.

pub mod artifacts;
pub mod console;
pub mod job;
pub mod properties;
pub mod publisher;
pub mod remote;
pub mod sequencer;

#[cfg(test)]
mod testing;

pub use artifacts::ArtifactPublicationCoordinator;
pub use console::{ConsoleRelay, ConsoleTransport};
pub use job::{JobLifecycleOrchestrator, JobOutcome, JobSettings};
pub use publisher::AgentPublisher;
pub use remote::ServerClient;
pub use sequencer::StepSequencer;
