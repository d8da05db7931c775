use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::agent::definition::AgentId;

use super::message::{Message, MessageType, Priority};

pub const TASK_ID_METADATA_KEY: &str = "taskId";
pub const COLLABORATION_ID_METADATA_KEY: &str = "collaborationId";
pub const COLLABORATION_METADATA_KEY: &str = "collaboration";

/// A collaboration exchange is bounded; past this many turns the handler
/// stops producing replies and the worker agents have to carry on themselves.
const MAX_COLLABORATION_TURNS: u32 = 8;

/// A handler's answer: re-enqueued by the broker as a fresh message from the
/// recipient back to the sender, with `reply_to` pointing at the original.
#[derive(Debug, PartialEq, Clone)]
pub struct Reply {
    pub message_type: MessageType,
    pub content: String,
    pub priority: Priority,
    pub metadata: BTreeMap<String, String>,
}

/// A typed message handler. The registry asks `can_handle` in order and
/// dispatches to the first match.
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, message: &Message) -> bool;

    /// Processes `message` on behalf of `recipient`.
    fn handle(&self, message: &Message, recipient: &AgentId) -> Option<Reply>;
}

/// Read-only view of the agent registry needed by handlers. Implemented by
/// the Agent Manager; injected so handlers are testable without one.
pub trait AgentDirectory: Send + Sync {
    fn capabilities_of(&self, id: &AgentId) -> Option<BTreeSet<String>>;
}

/// Ordered list of handlers, constructed explicitly and passed by reference
/// into the Message Broker.
pub struct ProtocolRegistry {
    handlers: Vec<Box<dyn MessageHandler>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// The default handler chain.
    pub fn with_defaults(
        directory: Arc<dyn AgentDirectory>,
        collaborations: CollaborationSessions,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TaskRequestHandler));
        registry.register(Box::new(CapabilityQueryHandler::new(directory)));
        registry.register(Box::new(CollaborationHandler::new(collaborations)));
        registry.register(Box::new(StatusUpdateHandler));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    /// Routes `message` to the first matching handler.
    pub fn dispatch(&self, message: &Message, recipient: &AgentId) -> Option<Reply> {
        let handler = self
            .handlers
            .iter()
            .find(|handler| handler.can_handle(message))?;
        debug!(
            handler = handler.name(),
            message_id = %message.id,
            "dispatching message"
        );
        handler.handle(message, recipient)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////////
// Default handlers
////////////////////////////////////////////////////////////////////////////////////

/// Acknowledges `task_request` messages with a `task_response` that copies
/// the original priority and task id.
pub struct TaskRequestHandler;

impl MessageHandler for TaskRequestHandler {
    fn name(&self) -> &str {
        "task_request"
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.message_type == MessageType::TaskRequest
    }

    fn handle(&self, message: &Message, recipient: &AgentId) -> Option<Reply> {
        let mut metadata = BTreeMap::new();
        if let Some(task_id) = message.metadata.get(TASK_ID_METADATA_KEY) {
            metadata.insert(TASK_ID_METADATA_KEY.to_string(), task_id.clone());
        }

        Some(Reply {
            message_type: MessageType::TaskResponse,
            content: format!("{recipient} accepted task request"),
            priority: message.priority,
            metadata,
        })
    }
}

/// Answers `capability_query` messages with the recipient's declared
/// capabilities matching the query body (every capability when empty).
pub struct CapabilityQueryHandler {
    directory: Arc<dyn AgentDirectory>,
}

impl CapabilityQueryHandler {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

impl MessageHandler for CapabilityQueryHandler {
    fn name(&self) -> &str {
        "capability_query"
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.message_type == MessageType::CapabilityQuery
    }

    fn handle(&self, message: &Message, recipient: &AgentId) -> Option<Reply> {
        let capabilities = self.directory.capabilities_of(recipient)?;
        let query = message.content.trim();

        let matching: Vec<&str> = capabilities
            .iter()
            .filter(|capability| query.is_empty() || capability.contains(query))
            .map(|capability| capability.as_str())
            .collect();

        Some(Reply {
            message_type: MessageType::Direct,
            content: matching.join(","),
            priority: message.priority,
            metadata: BTreeMap::new(),
        })
    }
}

/// One multi-turn exchange between two agents.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationSession {
    pub id: String,
    pub participants: Vec<AgentId>,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub turns: u32,
}

/// Shared collaboration topology: written by the handler, snapshotted for
/// `agent-relationships.json`.
#[derive(Clone, Default)]
pub struct CollaborationSessions(Arc<Mutex<BTreeMap<String, CollaborationSession>>>);

impl CollaborationSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CollaborationSession> {
        self.0.lock().unwrap().clone()
    }

    fn begin(&self, from: AgentId, recipient: AgentId) -> CollaborationSession {
        let now = Utc::now();
        let session = CollaborationSession {
            id: Ulid::new().to_string(),
            participants: vec![from, recipient],
            started_at: now,
            last_message_at: now,
            turns: 1,
        };
        self.0
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        session
    }

    fn advance(&self, id: &str) -> Option<CollaborationSession> {
        let mut sessions = self.0.lock().unwrap();
        let session = sessions.get_mut(id)?;
        session.turns += 1;
        session.last_message_at = Utc::now();
        Some(session.clone())
    }
}

/// Initiates or continues a multi-turn collaboration over `direct` messages
/// carrying collaboration metadata.
pub struct CollaborationHandler {
    sessions: CollaborationSessions,
}

impl CollaborationHandler {
    pub fn new(sessions: CollaborationSessions) -> Self {
        Self { sessions }
    }
}

impl MessageHandler for CollaborationHandler {
    fn name(&self) -> &str {
        "collaboration"
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.message_type == MessageType::Direct
            && (message.metadata.contains_key(COLLABORATION_METADATA_KEY)
                || message
                    .metadata
                    .contains_key(COLLABORATION_ID_METADATA_KEY))
    }

    fn handle(&self, message: &Message, recipient: &AgentId) -> Option<Reply> {
        let session = match message.metadata.get(COLLABORATION_ID_METADATA_KEY) {
            Some(id) => self.sessions.advance(id)?,
            None => self
                .sessions
                .begin(message.from.clone(), recipient.clone()),
        };

        if session.turns > MAX_COLLABORATION_TURNS {
            debug!(collaboration_id = session.id, "collaboration turn budget used up");
            return None;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(COLLABORATION_ID_METADATA_KEY.to_string(), session.id.clone());

        Some(Reply {
            message_type: MessageType::Direct,
            content: format!("{recipient} continuing collaboration {}", session.id),
            priority: message.priority,
            metadata,
        })
    }
}

/// `system` status updates are fire-and-forget.
pub struct StatusUpdateHandler;

impl MessageHandler for StatusUpdateHandler {
    fn name(&self) -> &str {
        "status_update"
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.message_type == MessageType::System
    }

    fn handle(&self, message: &Message, recipient: &AgentId) -> Option<Reply> {
        debug!(from = %message.from, to = %recipient, "status update: {}", message.content);
        None
    }
}
