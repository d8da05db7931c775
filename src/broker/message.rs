use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::agent::definition::{AgentId, AgentIdError};

/// Globally unique, lexically sortable message identifier.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct MessageId(Ulid);

impl MessageId {
    #[allow(clippy::new_without_default)] // a fresh id per call, Default would mislead
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery priority. Higher delivers first; FIFO within a priority.
#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    CapabilityQuery,
    Direct,
    System,
    ApprovalRequest,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::CapabilityQuery => "capability_query",
            MessageType::Direct => "direct",
            MessageType::System => "system",
            MessageType::ApprovalRequest => "approval_request",
        }
    }
}

pub const BROADCAST_SENTINEL: &str = "*";

/// Message recipient: a single agent or the broadcast wildcard.
#[derive(Debug, PartialEq, Eq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Recipient {
    Agent(AgentId),
    Broadcast,
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::Agent(id) => id.get(),
            Recipient::Broadcast => BROADCAST_SENTINEL.to_string(),
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = AgentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == BROADCAST_SENTINEL {
            Ok(Recipient::Broadcast)
        } else {
            Ok(Recipient::Agent(AgentId::try_from(value)?))
        }
    }
}

impl From<AgentId> for Recipient {
    fn from(id: AgentId) -> Self {
        Recipient::Agent(id)
    }
}

impl Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{id}"),
            Recipient::Broadcast => write!(f, "{BROADCAST_SENTINEL}"),
        }
    }
}

/// An inter-agent message. Immutable after construction: build it with the
/// `with_*` methods, then hand it to the broker.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub from: AgentId,
    pub to: Recipient,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl Message {
    pub fn new(
        from: AgentId,
        to: impl Into<Recipient>,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            from,
            to: to.into(),
            message_type,
            content: content.into(),
            priority: Priority::default(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            requires_approval: false,
            reply_to: None,
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(self, reply_to: MessageId) -> Self {
        Self {
            reply_to: Some(reply_to),
            ..self
        }
    }

    pub fn with_requires_approval(self, requires_approval: bool) -> Self {
        Self {
            requires_approval,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn recipient_serializes_as_plain_string() {
        assert_eq!(
            serde_json::to_string(&Recipient::Broadcast).unwrap(),
            "\"*\""
        );
        assert_eq!(
            serde_json::to_string(&Recipient::Agent(id("beta"))).unwrap(),
            "\"beta\""
        );

        let parsed: Recipient = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(parsed, Recipient::Broadcast);
        assert!(serde_json::from_str::<Recipient>("\"NOT VALID\"").is_err());
    }

    #[test]
    fn message_round_trips_through_json() {
        let message = Message::new(id("alpha"), id("beta"), MessageType::Direct, "hello")
            .with_priority(Priority::High)
            .with_metadata("k", "v");

        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.contains("\"priority\":\"HIGH\""));
        assert!(encoded.contains("\"type\":\"direct\""));

        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }
}
