use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::agent::definition::{Agent, AgentId, AgentPatch, AgentSpec, AgentStatus};
use crate::agent::manager::{start_event_loop, AgentManager};
use crate::approval::manager::{start_sweeper, ApprovalManager};
use crate::approval::record::{ApprovalId, ApprovalRecord, ApprovalRequest};
use crate::broker::broker::MessageBroker;
use crate::broker::handlers::{CollaborationSessions, ProtocolRegistry};
use crate::broker::history::HistoryEntry;
use crate::broker::message::Message;
use crate::broker::subscription::{Relationships, Subscription};
use crate::event::channel::{pub_sub, EventConsumer};
use crate::event::{AgentEvent, ApplicationEvent, EventBus};
use crate::metrics::sampler::{start_sampler, ControlPlaneSnapshot, MetricsSampler};
use crate::metrics::series::MetricsSeries;
use crate::registry::store::RegistryStore;
use crate::server::runner::Runner;
use crate::supervisor::supervisor::SupervisorEvent;
use crate::supervisor::ProcessSupervisorBuilder;
use crate::task::manager::{DelegationSpec, TaskDashboard, TaskFilter, TaskManager};
use crate::task::task::{Task, TaskId, TaskPatch, TaskSpec};
use crate::utils::thread_context::StartedThreadContext;
use crate::utils::threads::spawn_named_thread;

use super::config::ControlPlaneConfig;
use super::error::ControlPlaneError;

type Agents = AgentManager<ProcessSupervisorBuilder>;

/// Answer of `GET /api/health`.
#[derive(Debug, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: String,
    pub uptime_sec: u64,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Answer of `GET /api/system/status`.
#[derive(Debug, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub status: String,
    pub uptime_sec: u64,
    pub agents_total: usize,
    pub agents_running: usize,
    pub open_tasks: usize,
    pub pending_approvals: usize,
    /// `degraded` once a registry git commit has failed.
    pub journal: String,
}

/// Read-only sources handed to the metrics sampler.
struct SnapshotSources {
    agents: Arc<Agents>,
    tasks: Arc<TaskManager>,
    approvals: Arc<ApprovalManager>,
    broker: Arc<MessageBroker>,
}

impl ControlPlaneSnapshot for SnapshotSources {
    fn agent_statuses(&self) -> Vec<(AgentId, AgentStatus)> {
        self.agents
            .list(None)
            .into_iter()
            .map(|agent| (agent.id, agent.status))
            .collect()
    }

    fn tasks_by_status(&self) -> std::collections::BTreeMap<String, usize> {
        self.tasks.dashboard().by_status
    }

    fn open_tasks_of(&self, agent_id: &AgentId) -> usize {
        self.tasks
            .get_agent_tasks(agent_id)
            .iter()
            .filter(|task| !task.status.is_terminal())
            .count()
    }

    fn pending_approvals(&self) -> usize {
        self.approvals.get_pending().len()
    }

    fn messages_enqueued_total(&self) -> u64 {
        self.broker.enqueued_total()
    }
}

/// The root component. Owns every manager, the event bus and the background
/// threads; external surfaces (REST, CLI) go through this facade.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    store: Arc<RegistryStore>,
    bus: EventBus,
    agents: Arc<Agents>,
    broker: Arc<MessageBroker>,
    tasks: Arc<TaskManager>,
    approvals: Arc<ApprovalManager>,
    collaborations: CollaborationSessions,
    metrics_series: Arc<MetricsSeries>,
    sampler: Arc<MetricsSampler<SnapshotSources>>,
    supervisor_events: Mutex<Option<EventConsumer<SupervisorEvent>>>,
    background: Mutex<Vec<StartedThreadContext>>,
    accepting: AtomicBool,
    started_at: Instant,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Result<Arc<Self>, ControlPlaneError> {
        let store = Arc::new(RegistryStore::open(&config.working_dir)?);
        let bus = EventBus::new(config.event_subscriber_capacity);

        let (supervisor_publisher, supervisor_consumer) = pub_sub();
        let agents = Arc::new(AgentManager::new(
            ProcessSupervisorBuilder::new(config.supervisor.clone()),
            supervisor_publisher,
            config.supervisor.startup_timeout,
            store.clone(),
            bus.clone(),
        ));

        let collaborations = CollaborationSessions::new();
        let registry =
            ProtocolRegistry::with_defaults(agents.clone(), collaborations.clone());
        let broker = Arc::new(MessageBroker::new(
            config.broker.clone(),
            registry,
            Box::new(agents.clone()),
            store.clone(),
            bus.clone(),
        ));

        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            broker.clone(),
            bus.clone(),
        ));
        let approvals = Arc::new(ApprovalManager::new(store.clone(), bus.clone()));

        let metrics_series = Arc::new(MetricsSeries::new(config.metrics.retention));
        let sampler = Arc::new(MetricsSampler::new(
            Arc::new(SnapshotSources {
                agents: agents.clone(),
                tasks: tasks.clone(),
                approvals: approvals.clone(),
                broker: broker.clone(),
            }),
            metrics_series.clone(),
            store.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            bus,
            agents,
            broker,
            tasks,
            approvals,
            collaborations,
            metrics_series,
            sampler,
            supervisor_events: Mutex::new(Some(supervisor_consumer)),
            background: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
        }))
    }

    /// Loads persisted state without starting any worker; enough for
    /// one-shot CLI operations against the registry.
    pub fn load(&self) -> Result<(), ControlPlaneError> {
        let agents = self.agents.load_from_store()?;
        let tasks = self.tasks.load_from_store()?;
        let approvals = self.approvals.load_from_store()?;
        info!(agents, tasks, approvals, "registry state loaded");
        Ok(())
    }

    /// Loads persisted state and starts the workers and background threads.
    pub fn start(self: &Arc<Self>) -> Result<(), ControlPlaneError> {
        self.load()?;

        let relationships = self.store.load_relationships()?.unwrap_or_default();
        for agent in self.agents.list(None) {
            let subscription = relationships
                .subscriptions
                .get(&agent.id)
                .cloned()
                .unwrap_or_else(Subscription::all);
            self.broker.subscribe(agent.id, subscription);
        }
        self.broker
            .preload_history(self.store.load_messages_for_day(Utc::now().date_naive())?);

        self.broker.start();

        let supervisor_consumer = self
            .supervisor_events
            .lock()
            .unwrap()
            .take()
            .expect("start must run once");

        let mut background = self.background.lock().unwrap();
        background.push(start_event_loop(self.agents.clone(), supervisor_consumer));
        background.push(start_sweeper(
            self.approvals.clone(),
            self.config.approvals.sweep_interval,
        ));
        background.push(start_sampler(
            self.sampler.clone(),
            self.config.metrics.sample_interval,
        ));

        info!("control plane started");
        Ok(())
    }

    /// Starts the API server (when enabled) and blocks until a stop request
    /// arrives, then drains.
    pub fn run(
        self: &Arc<Self>,
        application_events: EventConsumer<ApplicationEvent>,
    ) -> Result<(), ControlPlaneError> {
        self.start()?;

        let server = if self.config.server.enabled {
            Some(Runner::new(self.config.server.clone(), self.clone()).start()?)
        } else {
            None
        };

        loop {
            match application_events.as_ref().recv() {
                Ok(ApplicationEvent::StopRequested) => break,
                Err(_) => break,
            }
        }
        info!("stop requested, draining");

        drop(server);
        self.shutdown();
        Ok(())
    }

    /// Graceful draining, bounded by the configured shutdown timeout; past
    /// the deadline outstanding work is abandoned (workers are force-killed
    /// by their terminators).
    pub fn shutdown(self: &Arc<Self>) {
        self.accepting.store(false, Ordering::SeqCst);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let this = self.clone();
        spawn_named_thread("shutdown drain", move || {
            this.drain();
            let _ = done_tx.send(());
        });

        match done_rx.recv_timeout(self.config.shutdown_timeout) {
            Ok(()) => info!("control plane stopped"),
            Err(_) => error!(
                timeout = ?self.config.shutdown_timeout,
                "shutdown timed out, abandoning outstanding workers"
            ),
        }
    }

    fn drain(&self) {
        for thread_context in self.background.lock().unwrap().drain(..) {
            let name = thread_context.thread_name().to_string();
            if let Err(err) = thread_context.stop() {
                warn!("error stopping '{name}': {err}");
            }
        }
        self.approvals.release_waiters();
        self.broker.shutdown();
        self.agents.stop_all();
        if let Err(err) = self.persist_relationships() {
            warn!("could not persist relationships on shutdown: {err}");
        }
    }

    fn ensure_accepting(&self) -> Result<(), ControlPlaneError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlPlaneError::ShuttingDown)
        }
    }

    fn persist_relationships(&self) -> Result<(), ControlPlaneError> {
        let relationships = Relationships {
            subscriptions: self.broker.subscriptions().into_iter().collect(),
            collaborations: self.collaborations.snapshot(),
        };
        self.store.save_relationships(&relationships)?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Agents
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn create_agent(&self, spec: AgentSpec) -> Result<Agent, ControlPlaneError> {
        self.ensure_accepting()?;
        let agent = self.agents.create(spec)?;
        self.broker.subscribe(agent.id.clone(), Subscription::all());
        self.persist_relationships()?;
        Ok(agent)
    }

    pub fn get_agent(&self, id: &AgentId) -> Result<Agent, ControlPlaneError> {
        Ok(self.agents.get(id)?)
    }

    pub fn list_agents(&self, status: Option<AgentStatus>) -> Vec<Agent> {
        self.agents.list(status)
    }

    pub fn list_running_agents(&self) -> Vec<Agent> {
        self.agents.list_running()
    }

    pub fn update_agent(
        &self,
        id: &AgentId,
        patch: AgentPatch,
    ) -> Result<Agent, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.agents.update(id, patch)?)
    }

    /// Deletes the agent and cascades: registry removal, cancellation of its
    /// open tasks, subscription drop, then the `agent-deleted` event.
    pub fn delete_agent(&self, id: &AgentId) -> Result<(), ControlPlaneError> {
        self.ensure_accepting()?;
        self.agents.delete(id)?;
        let cancelled = self.tasks.cancel_agent_tasks(id)?;
        if cancelled > 0 {
            info!(agent_id = %id, cancelled, "cancelled tasks of deleted agent");
        }
        self.broker.unsubscribe(id);
        self.persist_relationships()?;
        self.bus.publish(AgentEvent::AgentDeleted(id.clone()));
        Ok(())
    }

    /// `delete --force`: stops any live worker, forces the status to
    /// stopped, then runs the regular delete cascade.
    pub fn force_delete_agent(&self, id: &AgentId) -> Result<(), ControlPlaneError> {
        self.ensure_accepting()?;
        self.agents.stop(id)?;
        if !self.agents.get_status(id)?.is_deletable() {
            self.agents.override_status(id, AgentStatus::Stopped)?;
        }
        self.delete_agent(id)
    }

    pub fn start_agent(&self, id: &AgentId) -> Result<AgentStatus, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.agents.start(id)?)
    }

    pub fn stop_agent(&self, id: &AgentId) -> Result<AgentStatus, ControlPlaneError> {
        Ok(self.agents.stop(id)?)
    }

    pub fn restart_agent(&self, id: &AgentId) -> Result<AgentStatus, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.agents.restart(id)?)
    }

    pub fn agent_status(&self, id: &AgentId) -> Result<AgentStatus, ControlPlaneError> {
        Ok(self.agents.get_status(id)?)
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Messages
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn send_message(&self, message: Message) -> Result<(), ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.broker.send_message(message)?)
    }

    pub fn message_history(
        &self,
        agent_id: &AgentId,
        limit: usize,
        chronological: bool,
    ) -> Vec<HistoryEntry> {
        self.broker.get_message_history(agent_id, limit, chronological)
    }

    pub fn subscribe(
        &self,
        agent_id: AgentId,
        subscription: Subscription,
    ) -> Result<(), ControlPlaneError> {
        self.ensure_accepting()?;
        self.broker.subscribe(agent_id, subscription);
        self.persist_relationships()
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Tasks
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn create_task(&self, spec: TaskSpec) -> Result<Task, ControlPlaneError> {
        self.ensure_accepting()?;
        let task = self.tasks.create(spec)?;
        self.push_task_frame(&task);
        Ok(task)
    }

    /// Best-effort `task` frame to the owning worker; a worker that is not
    /// running picks the task up from its `task_request` message instead.
    fn push_task_frame(&self, task: &Task) {
        let frame = crate::agent::wire::ControlFrame::Task {
            id: task.id.to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            priority: format!("{:?}", task.priority).to_uppercase(),
        };
        self.agents.send_frame(&task.agent_id, &frame);
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task, ControlPlaneError> {
        Ok(self.tasks.get(id)?)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks.list(filter)
    }

    pub fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.tasks.update(id, patch)?)
    }

    pub fn delete_task(&self, id: &TaskId) -> Result<(), ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.tasks.delete(id)?)
    }

    pub fn delegate_task(
        &self,
        from: AgentId,
        to: AgentId,
        spec: DelegationSpec,
    ) -> Result<Task, ControlPlaneError> {
        self.ensure_accepting()?;
        let task = self.tasks.delegate(from, to, spec)?;
        self.push_task_frame(&task);
        Ok(task)
    }

    pub fn agent_health(
        &self,
        id: &AgentId,
    ) -> Option<crate::supervisor::health::HealthSample> {
        self.agents.health_of(id)
    }

    pub fn complete_task(
        &self,
        id: &TaskId,
        result: Option<String>,
    ) -> Result<Task, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.tasks.complete(id, result)?)
    }

    pub fn cancel_task(&self, id: &TaskId) -> Result<Task, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.tasks.cancel(id)?)
    }

    pub fn agent_tasks(&self, agent_id: &AgentId) -> Vec<Task> {
        self.tasks.get_agent_tasks(agent_id)
    }

    pub fn task_dashboard(&self) -> TaskDashboard {
        self.tasks.dashboard()
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Approvals
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn request_approval(&self, request: ApprovalRequest) -> Result<bool, ControlPlaneError> {
        self.ensure_accepting()?;
        Ok(self.approvals.request_approval(request)?)
    }

    pub fn respond_approval(
        &self,
        id: &ApprovalId,
        approved: bool,
        decided_by: &str,
        reason: Option<String>,
    ) -> bool {
        self.approvals.respond(id, approved, decided_by, reason)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRecord> {
        self.approvals.get_pending()
    }

    pub fn approval_history(&self, limit: usize) -> Result<Vec<ApprovalRecord>, ControlPlaneError> {
        Ok(self.approvals.get_history(limit)?)
    }

    pub fn agent_approval_history(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<ApprovalRecord>, ControlPlaneError> {
        Ok(self.approvals.get_agent_history(agent_id)?)
    }

    pub fn set_decision_callback(&self, callback: crate::approval::manager::DecisionCallback) {
        self.approvals.set_decision_callback(callback)
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Observability
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn metrics_series(&self) -> Arc<MetricsSeries> {
        self.metrics_series.clone()
    }

    pub fn agent_metrics_series(
        &self,
        agent_id: &AgentId,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
        interval: crate::metrics::series::Interval,
    ) -> Vec<crate::metrics::sampler::AgentSample> {
        self.sampler.agent_series(agent_id, start, end, interval)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok".to_string(),
            uptime_sec: self.uptime_secs(),
            timestamp: Utc::now(),
        }
    }

    pub fn registry_status(&self) -> Result<crate::registry::store::RegistryStatus, ControlPlaneError> {
        Ok(self.store.status()?)
    }

    pub fn registry_history(&self, limit: usize) -> Result<Vec<String>, ControlPlaneError> {
        Ok(self.store.journal_tail(limit)?)
    }

    pub fn registry_backup(&self, dest: &std::path::Path) -> Result<usize, ControlPlaneError> {
        Ok(self.store.backup(dest)?)
    }

    pub fn query_registry(&self, term: &str) -> Result<Vec<String>, ControlPlaneError> {
        Ok(self.store.query(term)?)
    }

    pub fn system_status(&self) -> SystemStatus {
        let agents = self.agents.list(None);
        let dashboard = self.tasks.dashboard();
        let open_tasks = dashboard.total
            - dashboard.by_status.get("done").copied().unwrap_or(0)
            - dashboard.by_status.get("cancelled").copied().unwrap_or(0);

        SystemStatus {
            status: "ok".to_string(),
            uptime_sec: self.uptime_secs(),
            agents_running: agents
                .iter()
                .filter(|agent| agent.status == AgentStatus::Running)
                .count(),
            agents_total: agents.len(),
            open_tasks,
            pending_approvals: self.approvals.get_pending().len(),
            journal: if self.store.is_journal_degraded() {
                "degraded".to_string()
            } else {
                "ok".to_string()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::tests::agent_spec;
    use crate::broker::message::Priority;
    use crate::server::config::ServerConfig;
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn id(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    fn control_plane() -> (Arc<ControlPlane>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = ControlPlaneConfig {
            server: ServerConfig {
                enabled: false,
                ..ServerConfig::default()
            },
            ..ControlPlaneConfig::default()
        }
        .with_working_dir(dir.path().to_path_buf());
        let control_plane = ControlPlane::new(config).unwrap();
        control_plane.start().unwrap();
        (control_plane, dir)
    }

    #[test]
    fn delete_agent_cascades_tasks_and_subscriptions() {
        let (control_plane, _dir) = control_plane();

        control_plane.create_agent(agent_spec("alpha")).unwrap();
        control_plane.create_agent(agent_spec("beta")).unwrap();
        let task = control_plane
            .create_task(crate::task::task::TaskSpec {
                agent_id: id("alpha"),
                title: "work".to_string(),
                description: String::new(),
                priority: Priority::Medium,
                requested_by: crate::task::task::Requester::User,
                dependencies: BTreeSet::new(),
            })
            .unwrap();

        control_plane.delete_agent(&id("alpha")).unwrap();

        assert_matches!(
            control_plane.get_agent(&id("alpha")),
            Err(ControlPlaneError::Agent(_))
        );
        assert_eq!(
            control_plane.get_task(&task.id).unwrap().status,
            crate::task::task::TaskStatus::Cancelled
        );
        assert!(!control_plane
            .broker
            .subscriptions()
            .contains_key(&id("alpha")));

        control_plane.shutdown();
    }

    #[test]
    fn mutations_are_rejected_while_draining() {
        let (control_plane, _dir) = control_plane();
        control_plane.shutdown();

        assert_matches!(
            control_plane.create_agent(agent_spec("alpha")),
            Err(ControlPlaneError::ShuttingDown)
        );
    }

    #[test]
    fn system_status_reports_journal_health() {
        let (control_plane, _dir) = control_plane();
        let status = control_plane.system_status();
        assert_eq!(status.status, "ok");
        assert_eq!(status.journal, "ok");
        assert_eq!(status.agents_total, 0);
        control_plane.shutdown();
    }
}
