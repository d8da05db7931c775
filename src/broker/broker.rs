use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::agent::definition::AgentId;
use crate::agent::wire::ControlFrame;
use crate::event::{BrokerEvent, EventBus};
use crate::registry::store::RegistryStore;
use crate::utils::threads::spawn_named_thread;

use super::error::BrokerError;
use super::handlers::{ProtocolRegistry, Reply};
use super::history::{DeliveryStatus, HistoryEntry, MessageHistory, DEFAULT_HISTORY_CAPACITY};
use super::message::{Message, Recipient};
use super::queue::DeliveryQueue;
use super::subscription::Subscription;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub history_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Pushes one encoded frame to a recipient's worker process. Implemented by
/// the Agent Manager; injected so the broker is testable without processes.
pub trait DeliverySink: Send + Sync {
    /// False when the recipient has no live worker to receive the frame.
    fn deliver(&self, to: &AgentId, frame: &ControlFrame) -> bool;
}

struct BrokerInner {
    /// One queue per worker; a message's `(from, to)` pair pins it to a
    /// queue, preserving priority preemption and per-priority send order for
    /// that pair.
    queues: Vec<DeliveryQueue>,
    queued: AtomicUsize,
    capacity: usize,
    subscriptions: Mutex<HashMap<AgentId, Subscription>>,
    history: MessageHistory,
    registry: ProtocolRegistry,
    sink: Box<dyn DeliverySink>,
    store: Arc<RegistryStore>,
    bus: EventBus,
    enqueued_total: AtomicU64,
}

/// Priority-ordered, asynchronous inter-agent message delivery.
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBroker {
    pub fn new(
        config: BrokerConfig,
        registry: ProtocolRegistry,
        sink: Box<dyn DeliverySink>,
        store: Arc<RegistryStore>,
        bus: EventBus,
    ) -> Self {
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(BrokerInner {
                queues: (0..workers).map(|_| DeliveryQueue::new()).collect(),
                queued: AtomicUsize::new(0),
                capacity: config.queue_capacity,
                subscriptions: Mutex::new(HashMap::new()),
                history: MessageHistory::new(config.history_capacity),
                registry,
                sink,
                store,
                bus,
                enqueued_total: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the delivery worker pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.inner.queues.len() {
            let inner = self.inner.clone();
            workers.push(spawn_named_thread(
                format!("broker worker {index}"),
                move || worker_loop(inner, index),
            ));
        }
        info!(workers = self.inner.queues.len(), "message broker started");
    }

    /// Enqueues `message` for delivery. Fails with `QueueFull` when the
    /// bounded queue is at capacity; the queue is left untouched.
    pub fn send_message(&self, message: Message) -> Result<(), BrokerError> {
        if let Recipient::Agent(to) = &message.to {
            if *to == message.from {
                return Err(BrokerError::SelfAddressed(message.from));
            }
        }
        self.inner.enqueue(message)
    }

    pub fn subscribe(&self, agent_id: AgentId, subscription: Subscription) {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(agent_id, subscription);
    }

    /// Drops the agent's subscription and its history index.
    pub fn unsubscribe(&self, agent_id: &AgentId) {
        self.inner.subscriptions.lock().unwrap().remove(agent_id);
        self.inner.history.drop_agent(agent_id);
    }

    pub fn subscriptions(&self) -> HashMap<AgentId, Subscription> {
        self.inner.subscriptions.lock().unwrap().clone()
    }

    pub fn get_message_history(
        &self,
        agent_id: &AgentId,
        limit: usize,
        chronological: bool,
    ) -> Vec<HistoryEntry> {
        self.inner.history.get(agent_id, limit, chronological)
    }

    /// Rebuilds the in-memory history index from a persisted segment.
    pub fn preload_history(&self, entries: impl IntoIterator<Item = HistoryEntry>) {
        self.inner.history.preload(entries);
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Messages accepted since startup; the metrics sampler diffs this.
    pub fn enqueued_total(&self) -> u64 {
        self.inner.enqueued_total.load(Ordering::Relaxed)
    }

    /// Closes the queues and joins the workers once they drained.
    pub fn shutdown(&self) {
        for queue in &self.inner.queues {
            queue.close();
        }
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        info!("message broker stopped");
    }
}

impl BrokerInner {
    fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        // reserve a slot before touching any queue so an overflowing send
        // cannot alter queue state
        loop {
            let current = self.queued.load(Ordering::SeqCst);
            if current >= self.capacity {
                return Err(BrokerError::QueueFull(self.capacity));
            }
            if self
                .queued
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let queue = &self.queues[self.queue_index(&message)];
        let id = message.id;
        if !queue.push(message) {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::ShuttingDown);
        }

        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(BrokerEvent::MessageEnqueued(id));
        Ok(())
    }

    /// Messages with the same `(from, to)` pair land on the same queue, so
    /// one worker sees every priority for that pair: its heap delivers the
    /// highest priority first and keeps FIFO within a priority.
    fn queue_index(&self, message: &Message) -> usize {
        let mut hasher = DefaultHasher::new();
        message.from.hash(&mut hasher);
        message.to.hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    fn process(&self, message: Message) {
        let recipients: Vec<AgentId> = match &message.to {
            Recipient::Agent(id) => vec![id.clone()],
            Recipient::Broadcast => self
                .subscriptions
                .lock()
                .unwrap()
                .keys()
                .filter(|id| **id != message.from)
                .cloned()
                .collect(),
        };

        if recipients.is_empty() {
            // a broadcast nobody can receive still leaves a trace, indexed
            // under the sender
            self.record(&message, message.from.clone(), DeliveryStatus::Undelivered);
            return;
        }

        for recipient in recipients {
            let subscribed = self
                .subscriptions
                .lock()
                .unwrap()
                .get(&recipient)
                .is_some_and(|subscription| subscription.matches(&message));

            let delivered =
                subscribed && self.sink.deliver(&recipient, &control_frame(&message));

            let status = if delivered {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Undelivered
            };
            self.record(&message, recipient.clone(), status);

            let event = if delivered {
                BrokerEvent::MessageDelivered {
                    id: message.id,
                    to: recipient.clone(),
                }
            } else {
                BrokerEvent::MessageUndeliverable {
                    id: message.id,
                    to: recipient.clone(),
                }
            };
            self.bus.publish(event);

            // protocol handlers act on the control-plane side for any
            // subscribed recipient, reachable worker or not
            if subscribed {
                if let Some(reply) = self.registry.dispatch(&message, &recipient) {
                    self.enqueue_reply(&message, recipient, reply);
                }
            }
        }
    }

    fn enqueue_reply(&self, original: &Message, recipient: AgentId, reply: Reply) {
        let mut response = Message::new(
            recipient,
            original.from.clone(),
            reply.message_type,
            reply.content,
        )
        .with_priority(reply.priority)
        .with_reply_to(original.id);
        for (key, value) in reply.metadata {
            response = response.with_metadata(key, value);
        }

        if let Err(err) = self.enqueue(response) {
            warn!(reply_to = %original.id, "could not enqueue handler reply: {err}");
        }
    }

    fn record(&self, message: &Message, recipient: AgentId, status: DeliveryStatus) {
        let entry = HistoryEntry::new(message.clone(), recipient, status);
        if let Err(err) = self.store.append_message(&entry) {
            warn!(message_id = %message.id, "could not persist history entry: {err}");
        }
        self.history.record(entry);
    }
}

fn worker_loop(inner: Arc<BrokerInner>, index: usize) {
    debug!(worker = index, "broker worker running");
    while let Some(message) = inner.queues[index].pop() {
        inner.queued.fetch_sub(1, Ordering::SeqCst);
        inner.process(message);
    }
    debug!(worker = index, "broker worker drained");
}

/// The wire form pushed to a recipient's worker process.
fn control_frame(message: &Message) -> ControlFrame {
    ControlFrame::Message {
        id: message.id.to_string(),
        from: message.from.get(),
        message_type: message.message_type.as_str().to_string(),
        content: message.content.clone(),
        metadata: serde_json::to_value(&message.metadata).unwrap_or_default(),
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::broker::handlers::tests::MockAgentDirectoryMock;
    use crate::broker::handlers::CollaborationSessions;
    use crate::broker::message::{MessageType, Priority};
    use assert_matches::assert_matches;
    use mockall::mock;
    use std::collections::BTreeSet;
    use std::sync::mpsc::{channel, Sender};
    use std::time::Duration;
    use tempfile::tempdir;

    mock! {
        pub DeliverySinkMock {}

        impl DeliverySink for DeliverySinkMock {
            fn deliver(&self, to: &AgentId, frame: &ControlFrame) -> bool;
        }
    }

    fn id(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    /// A sink that reports every delivery on a channel, in order.
    struct RecordingSink(Sender<(AgentId, ControlFrame)>);

    impl DeliverySink for RecordingSink {
        fn deliver(&self, to: &AgentId, frame: &ControlFrame) -> bool {
            self.0.send((to.clone(), frame.clone())).is_ok()
        }
    }

    fn directory() -> Arc<dyn crate::broker::handlers::AgentDirectory> {
        let mut directory = MockAgentDirectoryMock::new();
        directory
            .expect_capabilities_of()
            .returning(|_| Some(BTreeSet::from(["echo".to_string()])));
        Arc::new(directory)
    }

    fn broker_with_sink(
        config: BrokerConfig,
        sink: Box<dyn DeliverySink>,
    ) -> (MessageBroker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RegistryStore::open(dir.path()).unwrap());
        let registry =
            ProtocolRegistry::with_defaults(directory(), CollaborationSessions::new());
        let broker = MessageBroker::new(config, registry, sink, store, EventBus::default());
        (broker, dir)
    }

    #[test]
    fn send_to_self_is_rejected() {
        let (broker, _dir) = broker_with_sink(
            BrokerConfig::default(),
            Box::new(MockDeliverySinkMock::new()),
        );
        let message = Message::new(id("alpha"), id("alpha"), MessageType::Direct, "loop");
        assert_matches!(
            broker.send_message(message),
            Err(BrokerError::SelfAddressed(_))
        );
    }

    #[test]
    fn queue_full_leaves_queue_length_unchanged() {
        let config = BrokerConfig {
            queue_capacity: 2,
            workers: 1,
            ..BrokerConfig::default()
        };
        let (broker, _dir) =
            broker_with_sink(config, Box::new(MockDeliverySinkMock::new()));
        // workers not started: messages stay queued

        for n in 0..2 {
            broker
                .send_message(Message::new(
                    id("alpha"),
                    id("beta"),
                    MessageType::Direct,
                    n.to_string(),
                ))
                .unwrap();
        }
        assert_eq!(broker.queued_len(), 2);

        let overflow = Message::new(id("alpha"), id("beta"), MessageType::Direct, "overflow");
        assert_matches!(broker.send_message(overflow), Err(BrokerError::QueueFull(2)));
        assert_eq!(broker.queued_len(), 2);
    }

    #[test]
    fn priority_orders_delivery_for_one_sender_recipient_pair() {
        let (tx, rx) = channel();
        // the production-default pool: every priority of one (from, to) pair
        // must still land on the same queue
        let (broker, _dir) =
            broker_with_sink(BrokerConfig::default(), Box::new(RecordingSink(tx)));

        broker.subscribe(id("beta"), Subscription::all());
        for (priority, content) in [
            (Priority::Low, "low"),
            (Priority::Critical, "critical"),
            (Priority::Medium, "medium"),
        ] {
            broker
                .send_message(
                    Message::new(id("alpha"), id("beta"), MessageType::Direct, content)
                        .with_priority(priority),
                )
                .unwrap();
        }

        // start after enqueueing so the owning worker sees all three at once
        broker.start();

        let mut contents = Vec::new();
        for _ in 0..3 {
            let (_, frame) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let ControlFrame::Message { content, .. } = frame else {
                panic!("expected a message frame")
            };
            contents.push(content);
        }
        assert_eq!(contents, vec!["critical", "medium", "low"]);

        broker.shutdown();
    }

    #[test]
    fn every_priority_of_a_pair_shares_one_queue() {
        let (broker, _dir) = broker_with_sink(
            BrokerConfig::default(),
            Box::new(MockDeliverySinkMock::new()),
        );
        // workers not started: inspect queue placement directly

        for priority in [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ] {
            broker
                .send_message(
                    Message::new(id("alpha"), id("beta"), MessageType::Direct, "x")
                        .with_priority(priority),
                )
                .unwrap();
        }

        let occupied: Vec<usize> = broker
            .inner
            .queues
            .iter()
            .map(|queue| queue.len())
            .filter(|len| *len > 0)
            .collect();
        assert_eq!(occupied, vec![4]);
    }

    #[test]
    fn unsubscribed_recipient_goes_to_history_as_undelivered() {
        let (broker, _dir) = broker_with_sink(
            BrokerConfig {
                workers: 1,
                ..BrokerConfig::default()
            },
            // the sink must never be called for an unsubscribed recipient
            Box::new(MockDeliverySinkMock::new()),
        );
        broker.start();

        let message = Message::new(id("alpha"), id("beta"), MessageType::Direct, "lost");
        broker.send_message(message.clone()).unwrap();

        let entries = wait_for_history(&broker, &id("beta"), 1);
        assert_eq!(entries[0].status, DeliveryStatus::Undelivered);
        assert_eq!(entries[0].message.id, message.id);

        broker.shutdown();
    }

    #[test]
    fn broadcast_reaches_all_subscribed_agents_but_not_the_sender() {
        let (tx, rx) = channel();
        let (broker, _dir) = broker_with_sink(
            BrokerConfig {
                workers: 1,
                ..BrokerConfig::default()
            },
            Box::new(RecordingSink(tx)),
        );
        broker.subscribe(id("alpha"), Subscription::all());
        broker.subscribe(id("beta"), Subscription::all());
        broker.subscribe(id("gamma"), Subscription::all());
        broker.start();

        broker
            .send_message(Message::new(
                id("alpha"),
                Recipient::Broadcast,
                MessageType::System,
                "announcement",
            ))
            .unwrap();

        let mut recipients = BTreeSet::new();
        for _ in 0..2 {
            let (to, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            recipients.insert(to.get());
        }
        assert_eq!(
            recipients,
            BTreeSet::from(["beta".to_string(), "gamma".to_string()])
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        broker.shutdown();
    }

    #[test]
    fn task_request_produces_a_task_response_reply() {
        let (tx, rx) = channel();
        let (broker, _dir) = broker_with_sink(
            BrokerConfig {
                workers: 1,
                ..BrokerConfig::default()
            },
            Box::new(RecordingSink(tx)),
        );
        broker.subscribe(id("alpha"), Subscription::all());
        broker.subscribe(id("beta"), Subscription::all());
        broker.start();

        broker
            .send_message(
                Message::new(id("alpha"), id("beta"), MessageType::TaskRequest, "work")
                    .with_priority(Priority::High),
            )
            .unwrap();

        // first the original to beta, then the handler reply back to alpha
        let (to, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(to, id("beta"));
        let (to, frame) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(to, id("alpha"));
        let ControlFrame::Message { message_type, .. } = frame else {
            panic!("expected a message frame")
        };
        assert_eq!(message_type, "task_response");

        // the reply is a fresh message linked to the original
        let entries = wait_for_history(&broker, &id("alpha"), 1);
        assert!(entries[0].message.reply_to.is_some());
        assert_eq!(entries[0].message.priority, Priority::High);

        broker.shutdown();
    }

    fn wait_for_history(
        broker: &MessageBroker,
        agent_id: &AgentId,
        minimum: usize,
    ) -> Vec<HistoryEntry> {
        for _ in 0..100 {
            let entries = broker.get_message_history(agent_id, 100, true);
            if entries.len() >= minimum {
                return entries;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("history never reached {minimum} entries for {agent_id}");
    }
}
