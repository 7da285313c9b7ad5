//! Agent configuration parsing.

use gantry_core::AgentId;
use gantry_core::environment::EnvironmentContext;
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::node::{get_env_vars, get_first_int_arg, get_first_string_arg, positive};
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";
pub const DEFAULT_CONSOLE_CAPACITY: usize = 10_240;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CANCEL_WAIT: Duration = Duration::from_secs(300);

/// Agent-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the server the agent reports to.
    pub server_url: Url,
    /// Identity presented with every console upload.
    pub agent_id: AgentId,
    /// Relative job working directories are resolved against this.
    pub working_root: PathBuf,
    pub console: ConsoleSettings,
    /// Upper bound on waiting for an in-flight cancel hook.
    pub cancel_wait: Duration,
    /// Variables every job on this agent starts with.
    pub env: EnvironmentContext,
}

/// Console shipping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSettings {
    pub flush_interval: Duration,
    /// Lines buffered before the oldest are dropped.
    pub capacity: usize,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            capacity: DEFAULT_CONSOLE_CAPACITY,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: Url::parse(DEFAULT_SERVER_URL).expect("default server URL is valid"),
            agent_id: AgentId::new(),
            working_root: PathBuf::from("pipelines"),
            console: ConsoleSettings::default(),
            cancel_wait: DEFAULT_CANCEL_WAIT,
            env: EnvironmentContext::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        parse_agent_config(&content)
    }

    /// Resolve a job's working directory against the working root.
    pub fn resolve_working_dir(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.working_root.join(dir)
        }
    }
}

/// Parse agent configuration from KDL text.
pub fn parse_agent_config(kdl: &str) -> ConfigResult<AgentConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = AgentConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server-url" => {
                let raw = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("server-url value".to_string()))?;
                config.server_url = parse_url(&raw)?;
            }
            "agent-id" => {
                let raw = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("agent-id value".to_string()))?;
                config.agent_id = raw.parse().map_err(|e: uuid::Error| ConfigError::InvalidValue {
                    field: "agent-id".to_string(),
                    message: e.to_string(),
                })?;
            }
            "working-root" => {
                let raw = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("working-root value".to_string()))?;
                config.working_root = PathBuf::from(raw);
            }
            "cancel-wait-secs" => {
                let secs = get_first_int_arg(node).ok_or_else(|| {
                    ConfigError::MissingField("cancel-wait-secs value".to_string())
                })?;
                config.cancel_wait = Duration::from_secs(positive("cancel-wait-secs", secs)?);
            }
            "env" => {
                for var in get_env_vars(node) {
                    config.env.set(var);
                }
            }
            "console" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "flush-interval-ms" => {
                                let ms = get_first_int_arg(child).ok_or_else(|| {
                                    ConfigError::MissingField("flush-interval-ms value".to_string())
                                })?;
                                config.console.flush_interval =
                                    Duration::from_millis(positive("flush-interval-ms", ms)?);
                            }
                            "capacity" => {
                                let lines = get_first_int_arg(child).ok_or_else(|| {
                                    ConfigError::MissingField("capacity value".to_string())
                                })?;
                                config.console.capacity = positive("capacity", lines)? as usize;
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_url(raw: &str) -> ConfigResult<Url> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        field: "server-url".to_string(),
        message: e.to_string(),
    })
}
