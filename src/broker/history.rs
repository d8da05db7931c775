use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::definition::AgentId;

use super::message::Message;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Undelivered,
}

/// The terminal record of one (message, recipient) processing. Exactly one
/// entry exists per delivery attempt.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub message: Message,
    pub recipient: AgentId,
    pub status: DeliveryStatus,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(message: Message, recipient: AgentId, status: DeliveryStatus) -> Self {
        Self {
            message,
            recipient,
            status,
            recorded_at: Utc::now(),
        }
    }
}

/// Per-agent ring buffer of delivery records, indexed by recipient.
pub struct MessageHistory {
    per_agent: Mutex<HashMap<AgentId, VecDeque<HistoryEntry>>>,
    capacity: usize,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MessageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            per_agent: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        let mut per_agent = self.per_agent.lock().unwrap();
        let ring = per_agent.entry(entry.recipient.clone()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Records loaded from a persisted segment on startup.
    pub fn preload(&self, entries: impl IntoIterator<Item = HistoryEntry>) {
        for entry in entries {
            self.record(entry);
        }
    }

    /// Returns up to `limit` entries for `agent_id`; newest first unless
    /// `chronological`.
    pub fn get(&self, agent_id: &AgentId, limit: usize, chronological: bool) -> Vec<HistoryEntry> {
        let per_agent = self.per_agent.lock().unwrap();
        let Some(ring) = per_agent.get(agent_id) else {
            return Vec::new();
        };

        let mut entries: Vec<HistoryEntry> =
            ring.iter().rev().take(limit).cloned().collect();
        if chronological {
            entries.reverse();
        }
        entries
    }

    pub fn drop_agent(&self, agent_id: &AgentId) {
        self.per_agent.lock().unwrap().remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::message::MessageType;

    fn id(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    fn entry(content: &str) -> HistoryEntry {
        HistoryEntry::new(
            Message::new(id("alpha"), id("beta"), MessageType::Direct, content),
            id("beta"),
            DeliveryStatus::Delivered,
        )
    }

    #[test]
    fn newest_first_by_default() {
        let history = MessageHistory::new(10);
        history.record(entry("first"));
        history.record(entry("second"));

        let entries = history.get(&id("beta"), 10, false);
        assert_eq!(entries[0].message.content, "second");
        assert_eq!(entries[1].message.content, "first");

        let entries = history.get(&id("beta"), 10, true);
        assert_eq!(entries[0].message.content, "first");
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let history = MessageHistory::new(2);
        history.record(entry("first"));
        history.record(entry("second"));
        history.record(entry("third"));

        let entries = history.get(&id("beta"), 10, true);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.content, "second");
    }

    #[test]
    fn unknown_agent_has_no_history() {
        let history = MessageHistory::new(2);
        assert!(history.get(&id("nobody"), 10, false).is_empty());
    }
}
