use std::collections::BTreeSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::agent::definition::{AgentId, AgentIdError};
use crate::broker::message::Priority;

/// Globally unique, lexically sortable task identifier.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct TaskId(Ulid);

impl TaskId {
    #[allow(clippy::new_without_default)] // a fresh id per call, Default would mislead
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    #[serde(rename = "inprogress")]
    InProgress,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "inprogress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

pub const USER_REQUESTER: &str = "user";

/// Who asked for a task: another agent or the human operator.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Requester {
    Agent(AgentId),
    User,
}

impl From<Requester> for String {
    fn from(value: Requester) -> Self {
        match value {
            Requester::Agent(id) => id.get(),
            Requester::User => USER_REQUESTER.to_string(),
        }
    }
}

impl TryFrom<String> for Requester {
    type Error = AgentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == USER_REQUESTER {
            Ok(Requester::User)
        } else {
            Ok(Requester::Agent(AgentId::try_from(value)?))
        }
    }
}

impl Display for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requester::Agent(id) => write!(f, "{id}"),
            Requester::User => write!(f, "{USER_REQUESTER}"),
        }
    }
}

/// A unit of work owned by one agent, part of the dependency graph.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub requested_by: Requester,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// 0..=100; exactly 100 iff the task is done.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Creation payload.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub agent_id: AgentId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_requester")]
    pub requested_by: Requester,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
}

fn default_requester() -> Requester {
    Requester::User
}

/// Partial update applied by `update`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub dependencies: Option<BTreeSet<TaskId>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_without_separator() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"cancelled\"").unwrap(),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn requester_uses_the_user_sentinel() {
        assert_eq!(
            serde_json::to_string(&Requester::User).unwrap(),
            "\"user\""
        );
        let parsed: Requester = serde_json::from_str("\"alpha\"").unwrap();
        assert_eq!(parsed, Requester::Agent(AgentId::new("alpha").unwrap()));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }
}
