use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::event::{
    AgentEvent, ApprovalEvent, BrokerEvent, ControlPlaneEvent, SystemEvent, TaskEvent,
};

/// One frame on the observer stream: `{type, data, timestamp}`.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl WsFrame {
    pub fn new(frame_type: impl Into<String>, data: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Maps a bus event to its observer frame. Internal events (subscriber
    /// lag, controlled exits) produce none.
    pub fn from_event(event: &ControlPlaneEvent) -> Option<Self> {
        let frame = match event {
            ControlPlaneEvent::Agent(agent) => match agent {
                AgentEvent::AgentCreated(id) => {
                    Self::new("agent_created", json!({ "agentId": id.get() }))
                }
                AgentEvent::AgentDeleted(id) => {
                    Self::new("agent_deleted", json!({ "agentId": id.get() }))
                }
                AgentEvent::AgentResponse { id, content } => Self::new(
                    "agent_response",
                    json!({ "agentId": id.get(), "content": content }),
                ),
                AgentEvent::AgentUpdated(id) => Self::new(
                    "system_status_update",
                    json!({ "agentId": id.get(), "change": "updated" }),
                ),
                AgentEvent::AgentStatusChanged(id, status) => Self::new(
                    "system_status_update",
                    json!({ "agentId": id.get(), "status": status.to_string() }),
                ),
                AgentEvent::AgentCrashed { id, exit_code } => Self::new(
                    "system_status_update",
                    json!({ "agentId": id.get(), "status": "crashed", "exitCode": exit_code }),
                ),
                AgentEvent::AgentRestarted(id) => Self::new(
                    "system_status_update",
                    json!({ "agentId": id.get(), "change": "restarted" }),
                ),
                AgentEvent::AgentHealth(id, sample) => Self::new(
                    "system_status_update",
                    json!({ "agentId": id.get(), "health": sample }),
                ),
            },
            ControlPlaneEvent::Broker(broker) => match broker {
                BrokerEvent::MessageDelivered { id, to } => Self::new(
                    "agent_message",
                    json!({ "messageId": id.to_string(), "to": to.get(), "delivered": true }),
                ),
                BrokerEvent::MessageUndeliverable { id, to } => Self::new(
                    "agent_message",
                    json!({ "messageId": id.to_string(), "to": to.get(), "delivered": false }),
                ),
                BrokerEvent::MessageEnqueued(_) => return None,
            },
            ControlPlaneEvent::Task(task) => match task {
                TaskEvent::TaskCreated(id) => {
                    Self::new("task_created", json!({ "taskId": id.to_string() }))
                }
                TaskEvent::TaskUpdated(id) | TaskEvent::TaskCancelled(id) => {
                    Self::new("task_updated", json!({ "taskId": id.to_string() }))
                }
                TaskEvent::TaskDelegated { task_id, from, to } => Self::new(
                    "task_delegated",
                    json!({
                        "taskId": task_id.to_string(),
                        "from": from.get(),
                        "to": to.get(),
                    }),
                ),
                TaskEvent::TaskCompleted(id) => {
                    Self::new("task_completed", json!({ "taskId": id.to_string() }))
                }
            },
            ControlPlaneEvent::Approval(approval) => match approval {
                ApprovalEvent::ApprovalRequested(id) => {
                    Self::new("approval_request", json!({ "approvalId": id.to_string() }))
                }
                ApprovalEvent::ApprovalDecided { id, status } => Self::new(
                    "approval_decided",
                    json!({ "approvalId": id.to_string(), "status": status.to_string() }),
                ),
            },
            ControlPlaneEvent::System(system) => match system {
                SystemEvent::StatusUpdate => Self::new("system_status_update", json!({})),
                SystemEvent::SubscriberLagged { .. } => return None,
            },
        };
        Some(frame)
    }
}
