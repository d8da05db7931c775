use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::definition::AgentId;

use super::handlers::CollaborationSession;
use super::message::{Message, MessageType};

/// Interest filter for one agent. `None` types means every type; metadata
/// entries are equality predicates that must all hold.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct Subscription {
    #[serde(default)]
    pub types: Option<BTreeSet<MessageType>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Subscription {
    /// The implicit subscription every agent gets on registration: all types,
    /// no predicates.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_types(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(&message.message_type) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, value)| message.metadata.get(key) == Some(value))
    }
}

/// Persisted form of `agent-relationships.json`: the subscription table and
/// the collaboration topology.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct Relationships {
    #[serde(default)]
    pub subscriptions: BTreeMap<AgentId, Subscription>,
    #[serde(default)]
    pub collaborations: BTreeMap<String, CollaborationSession>,
}
