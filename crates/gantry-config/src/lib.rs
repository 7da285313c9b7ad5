//! KDL configuration parsing for the Gantry build agent.
//!
//! This crate handles parsing of:
//! - Agent configuration (agent.kdl)
//! - Work assignment files, for running a job outside the server

pub mod agent;
pub mod assignment;
pub mod error;
mod node;

pub use agent::{AgentConfig, ConsoleSettings, parse_agent_config};
pub use assignment::parse_assignment;
pub use error::{ConfigError, ConfigResult};
