//! Core domain types and traits for the Gantry build agent.
//!
//! This crate contains:
//! - Agent and job identifiers
//! - Work assignments as dispatched by the server
//! - Build steps, run-if policies and job results
//! - Artifact plans, stores and the upload/extension seams
//! - The job environment and its console reporting
//! - The publisher and material collaborator traits

pub mod artifact;
pub mod assignment;
pub mod environment;
pub mod error;
pub mod id;
pub mod material;
pub mod publisher;
pub mod step;

pub use error::{Error, Result};
pub use id::{AgentId, JobIdentifier};
