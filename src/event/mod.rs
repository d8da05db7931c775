//! Typed event system connecting the control-plane components.
//!
//! Every state mutation publishes one of the closed event variants below.
//! Components communicate through [`channel`] pub/sub pairs; observers fan
//! out through the bounded [`broadcaster`].

pub mod broadcaster;
pub mod cancellation;
pub mod channel;

use crate::agent::definition::{AgentId, AgentStatus};
use crate::approval::record::{ApprovalId, ApprovalStatus};
use crate::broker::message::MessageId;
use crate::supervisor::health::HealthSample;
use crate::task::task::TaskId;

use broadcaster::{BoundedBroadcast, SubscriberId};
use tracing::warn;

/// Application events: these are sent directly to the run loop. Eg: OS-signals.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplicationEvent {
    StopRequested,
}

/// Events produced by the Agent Manager and the Process Supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    AgentCreated(AgentId),
    AgentUpdated(AgentId),
    AgentDeleted(AgentId),
    AgentStatusChanged(AgentId, AgentStatus),
    AgentCrashed {
        id: AgentId,
        exit_code: i32,
    },
    AgentRestarted(AgentId),
    /// A `response` frame emitted by the worker process.
    AgentResponse {
        id: AgentId,
        content: String,
    },
    AgentHealth(AgentId, HealthSample),
}

/// Events produced by the Message Broker.
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEvent {
    MessageEnqueued(MessageId),
    MessageDelivered { id: MessageId, to: AgentId },
    MessageUndeliverable { id: MessageId, to: AgentId },
}

/// Events produced by the Task Manager.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    TaskCreated(TaskId),
    TaskUpdated(TaskId),
    TaskDelegated {
        task_id: TaskId,
        from: AgentId,
        to: AgentId,
    },
    TaskCompleted(TaskId),
    TaskCancelled(TaskId),
}

/// Events produced by the Approval Manager.
#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalEvent {
    ApprovalRequested(ApprovalId),
    ApprovalDecided {
        id: ApprovalId,
        status: ApprovalStatus,
    },
}

/// System-level events.
#[derive(Clone, Debug, PartialEq)]
pub enum SystemEvent {
    StatusUpdate,
    SubscriberLagged { subscriber_id: SubscriberId },
}

/// The union of every event the control plane can publish to observers.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlPlaneEvent {
    Agent(AgentEvent),
    Broker(BrokerEvent),
    Task(TaskEvent),
    Approval(ApprovalEvent),
    System(SystemEvent),
}

impl From<AgentEvent> for ControlPlaneEvent {
    fn from(event: AgentEvent) -> Self {
        Self::Agent(event)
    }
}

impl From<BrokerEvent> for ControlPlaneEvent {
    fn from(event: BrokerEvent) -> Self {
        Self::Broker(event)
    }
}

impl From<TaskEvent> for ControlPlaneEvent {
    fn from(event: TaskEvent) -> Self {
        Self::Task(event)
    }
}

impl From<ApprovalEvent> for ControlPlaneEvent {
    fn from(event: ApprovalEvent) -> Self {
        Self::Approval(event)
    }
}

impl From<SystemEvent> for ControlPlaneEvent {
    fn from(event: SystemEvent) -> Self {
        Self::System(event)
    }
}

/// Fan-out of [`ControlPlaneEvent`]s over bounded per-subscriber channels.
///
/// Subscribers that fall behind are removed and the removal is announced with
/// a [`SystemEvent::SubscriberLagged`] event so they can reconnect.
#[derive(Clone, Default)]
pub struct EventBus(BoundedBroadcast<ControlPlaneEvent>);

impl EventBus {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self(BoundedBroadcast::new(subscriber_capacity))
    }

    pub fn subscribe(
        &self,
    ) -> (
        SubscriberId,
        crossbeam::channel::Receiver<ControlPlaneEvent>,
    ) {
        self.0.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.0.unsubscribe(id)
    }

    pub fn publish(&self, event: impl Into<ControlPlaneEvent>) {
        let lagged = self.0.broadcast(event.into());
        for subscriber_id in lagged {
            warn!(subscriber_id, "dropping lagged event subscriber");
            // a second lag here only removes the subscriber, it is not re-signalled
            let _ = self
                .0
                .broadcast(SystemEvent::SubscriberLagged { subscriber_id }.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(4);
        let (_, first) = bus.subscribe();
        let (_, second) = bus.subscribe();

        bus.publish(SystemEvent::StatusUpdate);

        assert_eq!(
            first.recv().unwrap(),
            ControlPlaneEvent::System(SystemEvent::StatusUpdate)
        );
        assert_eq!(
            second.recv().unwrap(),
            ControlPlaneEvent::System(SystemEvent::StatusUpdate)
        );
    }

    #[test]
    fn test_lagged_subscriber_gets_dropped_and_signalled() {
        let bus = EventBus::new(2);
        let (slow_id, _slow_rx) = bus.subscribe();
        let (_, fast_rx) = bus.subscribe();

        // the slow subscriber never drains its two-slot queue, the fast one does
        bus.publish(SystemEvent::StatusUpdate);
        assert_eq!(
            fast_rx.recv().unwrap(),
            ControlPlaneEvent::System(SystemEvent::StatusUpdate)
        );
        bus.publish(SystemEvent::StatusUpdate);
        assert_eq!(
            fast_rx.recv().unwrap(),
            ControlPlaneEvent::System(SystemEvent::StatusUpdate)
        );

        bus.publish(SystemEvent::StatusUpdate);
        assert_eq!(
            fast_rx.recv().unwrap(),
            ControlPlaneEvent::System(SystemEvent::StatusUpdate)
        );
        assert_eq!(
            fast_rx.recv().unwrap(),
            ControlPlaneEvent::System(SystemEvent::SubscriberLagged {
                subscriber_id: slow_id
            })
        );
    }
}
