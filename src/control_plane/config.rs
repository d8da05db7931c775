use std::path::{Path, PathBuf};
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;
use thiserror::Error;

use crate::approval::manager::ApprovalConfig;
use crate::broker::broker::BrokerConfig;
use crate::metrics::sampler::MetricsConfig;
use crate::server::config::ServerConfig;
use crate::supervisor::SupervisorConfig;

pub const DEFAULT_EVENT_SUBSCRIBER_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("error parsing config: `{0}`")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level configuration, loaded from YAML. Every field has a default so
/// an empty file (or none at all) yields a working control plane rooted in
/// the current directory.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub working_dir: PathBuf,
    pub supervisor: SupervisorConfig,
    pub broker: BrokerConfig,
    pub approvals: ApprovalConfig,
    pub metrics: MetricsConfig,
    pub server: ServerConfig,
    pub event_subscriber_capacity: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            supervisor: SupervisorConfig::default(),
            broker: BrokerConfig::default(),
            approvals: ApprovalConfig::default(),
            metrics: MetricsConfig::default(),
            server: ServerConfig::default(),
            event_subscriber_capacity: DEFAULT_EVENT_SUBSCRIBER_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ControlPlaneConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Loads `path` when given, falls back to defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn with_working_dir(self, working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..self
        }
    }
}
