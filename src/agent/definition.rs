use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::ops::Deref;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved identifier of the control plane itself.
pub const CONTROL_PLANE_ID: &str = "control-plane";

const AGENT_ID_PATTERN: &str = "^[a-z][a-z0-9_-]{0,63}$";

fn agent_id_regex() -> &'static Regex {
    static AGENT_ID_REGEX: OnceLock<Regex> = OnceLock::new();
    AGENT_ID_REGEX.get_or_init(|| Regex::new(AGENT_ID_PATTERN).expect("pattern is valid"))
}

/// Unique identifier of an agent. Lowercase alphanumeric plus `_` and `-`,
/// starting with a letter, at most 64 characters.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Hash, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct AgentId(String);

#[derive(Error, Debug, PartialEq)]
pub enum AgentIdError {
    #[error("agent id must match `{AGENT_ID_PATTERN}`")]
    InvalidFormat,
    #[error("agent id `{0}` is reserved")]
    Reserved(String),
}

impl AgentId {
    pub fn new(s: &str) -> Result<Self, AgentIdError> {
        Self::try_from(s.to_string())
    }

    pub fn get(&self) -> String {
        String::from(&self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = AgentIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == CONTROL_PLANE_ID {
            return Err(AgentIdError::Reserved(s));
        }
        if agent_id_regex().is_match(&s) {
            Ok(AgentId(s))
        } else {
            Err(AgentIdError::InvalidFormat)
        }
    }
}

impl Deref for AgentId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Inactive,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Unknown,
}

impl AgentStatus {
    /// A deleted agent must not own a live subprocess.
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            AgentStatus::Inactive | AgentStatus::Stopped | AgentStatus::Crashed
        )
    }

    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            AgentStatus::Inactive | AgentStatus::Stopped | AgentStatus::Crashed
        )
    }
}

impl Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Inactive => "inactive",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Crashed => "crashed",
            AgentStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

const DEFAULT_MAX_CPU_PERCENT: f32 = 80.0;
const DEFAULT_MAX_MEMORY_MB: u64 = 500;
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cpu_percent: f32,
    pub max_memory_mb: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: DEFAULT_MAX_CPU_PERCENT,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

/// How the worker subprocess is launched.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct WorkerCommand {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            ..Default::default()
        }
    }

    pub fn with_args(self, args: Vec<String>) -> Self {
        Self { args, ..self }
    }
}

/// The persisted agent record.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub command: WorkerCommand,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
}

const AGENT_NAME_MAX_LENGTH: usize = 128;

#[derive(Error, Debug, PartialEq)]
pub enum AgentSpecError {
    #[error("{0}")]
    InvalidId(#[from] AgentIdError),
    #[error("agent name must be non-empty and at most {AGENT_NAME_MAX_LENGTH} characters")]
    InvalidName,
    #[error("agent system prompt must be non-empty")]
    InvalidPrompt,
}

/// Creation payload, validated at the boundary.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub command: WorkerCommand,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl Agent {
    pub fn from_spec(spec: AgentSpec) -> Result<Self, AgentSpecError> {
        let id = AgentId::new(&spec.id)?;
        if spec.name.is_empty() || spec.name.len() > AGENT_NAME_MAX_LENGTH {
            return Err(AgentSpecError::InvalidName);
        }
        if spec.system_prompt.is_empty() {
            return Err(AgentSpecError::InvalidPrompt);
        }
        Ok(Agent {
            id,
            name: spec.name,
            system_prompt: spec.system_prompt,
            command: spec.command,
            resource_limits: spec.resource_limits,
            capabilities: spec.capabilities,
            status: AgentStatus::Inactive,
            created_at: Utc::now(),
            last_health_check: None,
        })
    }
}

/// Partial update applied by `update`. Resource-limit changes take effect at
/// the next restart of the worker process.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub command: Option<WorkerCommand>,
    pub resource_limits: Option<ResourceLimits>,
    pub capabilities: Option<BTreeSet<String>>,
}

impl AgentPatch {
    pub fn apply(&self, agent: &mut Agent) -> Result<(), AgentSpecError> {
        if let Some(name) = &self.name {
            if name.is_empty() || name.len() > AGENT_NAME_MAX_LENGTH {
                return Err(AgentSpecError::InvalidName);
            }
            agent.name = name.clone();
        }
        if let Some(prompt) = &self.system_prompt {
            if prompt.is_empty() {
                return Err(AgentSpecError::InvalidPrompt);
            }
            agent.system_prompt = prompt.clone();
        }
        if let Some(command) = &self.command {
            agent.command = command.clone();
        }
        if let Some(limits) = &self.resource_limits {
            agent.resource_limits = *limits;
        }
        if let Some(capabilities) = &self.capabilities {
            agent.capabilities = capabilities.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn agent_spec(id: &str) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            name: format!("{id} agent"),
            system_prompt: "you are a test worker".to_string(),
            command: WorkerCommand::new("sleep").with_args(vec!["60".to_string()]),
            resource_limits: ResourceLimits::default(),
            capabilities: BTreeSet::from(["echo".to_string()]),
        }
    }

    #[test]
    fn agent_id_validator() {
        assert!(AgentId::new("ab").is_ok());
        assert!(AgentId::new("a01b").is_ok());
        assert!(AgentId::new("a-1_b").is_ok());
        assert!(AgentId::new(&format!("a{}", "b".repeat(63))).is_ok());

        assert!(AgentId::new("").is_err());
        assert!(AgentId::new("A").is_err());
        assert!(AgentId::new("1a").is_err());
        assert!(AgentId::new(&format!("a{}", "b".repeat(64))).is_err());
        assert!(AgentId::new("a.b").is_err());
        assert!(AgentId::new("a b").is_err());
        assert!(AgentId::new("京bc012").is_err());
    }

    #[test]
    fn control_plane_id_is_reserved() {
        assert_eq!(
            AgentId::new(CONTROL_PLANE_ID).unwrap_err(),
            AgentIdError::Reserved(CONTROL_PLANE_ID.to_string())
        );
    }

    #[test]
    fn from_spec_validates_name_and_prompt() {
        let mut spec = agent_spec("alpha");
        spec.name = String::new();
        assert_eq!(
            Agent::from_spec(spec).unwrap_err(),
            AgentSpecError::InvalidName
        );

        let mut spec = agent_spec("alpha");
        spec.system_prompt = String::new();
        assert_eq!(
            Agent::from_spec(spec).unwrap_err(),
            AgentSpecError::InvalidPrompt
        );

        let agent = Agent::from_spec(agent_spec("alpha")).unwrap();
        assert_eq!(agent.status, AgentStatus::Inactive);
        assert_eq!(agent.id.get(), "alpha");
    }

    #[test]
    fn patch_applies_only_provided_fields() {
        let mut agent = Agent::from_spec(agent_spec("alpha")).unwrap();
        let patch = AgentPatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        patch.apply(&mut agent).unwrap();
        assert_eq!(agent.name, "renamed");
        assert_eq!(agent.system_prompt, "you are a test worker");
    }
}
