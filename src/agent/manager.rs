use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::broker::broker::DeliverySink;
use crate::broker::handlers::AgentDirectory;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::event::{AgentEvent, EventBus};
use crate::registry::journal::{Entity, Mutation, Op};
use crate::registry::store::RegistryStore;
use crate::supervisor::supervisor::SupervisorEvent;
use crate::supervisor::{SupervisorBuilder, SupervisorStarter, SupervisorStopper};
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};

use super::definition::{Agent, AgentId, AgentPatch, AgentSpec, AgentStatus};
use super::error::AgentError;
use super::wire::ControlFrame;

type StopperOf<B> = <<B as SupervisorBuilder>::Starter as SupervisorStarter>::Stopper;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Authoritative view of agents. Subprocess mechanics are delegated to the
/// injected [`SupervisorBuilder`]; at most one live supervisor exists per
/// agent id.
pub struct AgentManager<B: SupervisorBuilder> {
    agents: Mutex<HashMap<AgentId, Agent>>,
    supervisors: Mutex<HashMap<AgentId, StopperOf<B>>>,
    health: Mutex<HashMap<AgentId, crate::supervisor::health::HealthSample>>,
    builder: B,
    supervisor_publisher: EventPublisher<SupervisorEvent>,
    startup_timeout: Duration,
    store: Arc<RegistryStore>,
    bus: EventBus,
}

impl<B: SupervisorBuilder> AgentManager<B> {
    pub fn new(
        builder: B,
        supervisor_publisher: EventPublisher<SupervisorEvent>,
        startup_timeout: Duration,
        store: Arc<RegistryStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            builder,
            supervisor_publisher,
            startup_timeout,
            store,
            bus,
        }
    }

    /// The most recent health observation of the agent's worker, if the
    /// monitor has sampled one.
    pub fn health_of(&self, id: &AgentId) -> Option<crate::supervisor::health::HealthSample> {
        self.health.lock().unwrap().get(id).cloned()
    }

    /// Loads persisted agents. Statuses implying a live subprocess are
    /// normalized to `unknown`: the processes did not survive the control
    /// plane. Returns the count.
    pub fn load_from_store(&self) -> Result<usize, AgentError> {
        let loaded = self.store.load_agents()?;
        let mut agents = self.agents.lock().unwrap();
        let count = loaded.len();
        for mut agent in loaded {
            if matches!(
                agent.status,
                AgentStatus::Starting | AgentStatus::Running | AgentStatus::Stopping
            ) {
                agent.status = AgentStatus::Unknown;
            }
            agents.insert(agent.id.clone(), agent);
        }
        Ok(count)
    }

    pub fn create(&self, spec: AgentSpec) -> Result<Agent, AgentError> {
        let agent = Agent::from_spec(spec)?;

        let mut agents = self.agents.lock().unwrap();
        if agents.contains_key(&agent.id) {
            return Err(AgentError::DuplicateId(agent.id.get()));
        }

        agents.insert(agent.id.clone(), agent.clone());
        // persisted before the event goes out
        self.persist(&agents, Op::Create, &agent.id)?;
        drop(agents);

        info!(agent_id = %agent.id, "agent created");
        self.bus.publish(AgentEvent::AgentCreated(agent.id.clone()));
        Ok(agent)
    }

    pub fn get(&self, id: &AgentId) -> Result<Agent, AgentError> {
        self.agents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::AgentNotFound(id.get()))
    }

    pub fn list(&self, status: Option<AgentStatus>) -> Vec<Agent> {
        let agents = self.agents.lock().unwrap();
        let mut result: Vec<Agent> = agents
            .values()
            .filter(|agent| status.map_or(true, |wanted| agent.status == wanted))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    pub fn list_running(&self) -> Vec<Agent> {
        self.list(Some(AgentStatus::Running))
    }

    pub fn get_status(&self, id: &AgentId) -> Result<AgentStatus, AgentError> {
        Ok(self.get(id)?.status)
    }

    /// Applies `patch` live; resource-limit changes take effect at the next
    /// restart of the worker.
    pub fn update(&self, id: &AgentId, patch: AgentPatch) -> Result<Agent, AgentError> {
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| AgentError::AgentNotFound(id.get()))?;
        patch.apply(agent)?;
        let updated = agent.clone();
        self.persist(&agents, Op::Update, id)?;
        drop(agents);

        self.bus.publish(AgentEvent::AgentUpdated(id.clone()));
        Ok(updated)
    }

    /// Removes the agent record. Fails with `StillRunning` unless the agent
    /// is inactive, stopped or crashed. Task cancellation, subscription
    /// cleanup and the final `agent-deleted` event are the caller's side of
    /// the cascade.
    pub fn delete(&self, id: &AgentId) -> Result<(), AgentError> {
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .get(id)
            .ok_or_else(|| AgentError::AgentNotFound(id.get()))?;
        if !agent.status.is_deletable() {
            return Err(AgentError::StillRunning(id.get()));
        }

        agents.remove(id);
        self.persist(&agents, Op::Delete, id)?;
        drop(agents);

        info!(agent_id = %id, "agent removed from the registry");
        Ok(())
    }

    /// Spawns and supervises the worker. Idempotent for a running agent.
    /// The agent is `running` once its worker reports ready within the
    /// startup timeout.
    pub fn start(&self, id: &AgentId) -> Result<AgentStatus, AgentError> {
        let agent = {
            let mut agents = self.agents.lock().unwrap();
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::AgentNotFound(id.get()))?;
            match agent.status {
                AgentStatus::Running | AgentStatus::Starting => {
                    return Ok(agent.status);
                }
                AgentStatus::Stopping => {
                    return Err(AgentError::StillRunning(id.get()));
                }
                _ => {}
            }
            agent.status = AgentStatus::Starting;
            let snapshot = agent.clone();
            self.persist(&agents, Op::Update, id)?;
            snapshot
        };
        self.bus
            .publish(AgentEvent::AgentStatusChanged(id.clone(), AgentStatus::Starting));

        let stopper = match self.spawn_supervised(&agent) {
            Ok(stopper) => stopper,
            Err(err) => {
                self.transition(id, AgentStatus::Stopped);
                return Err(err);
            }
        };

        if !stopper.wait_ready(self.startup_timeout) {
            warn!(agent_id = %id, "worker never reported ready, stopping it");
            if let Err(err) = stopper.stop() {
                error!(agent_id = %id, "error stopping unready worker: {err}");
            }
            self.transition(id, AgentStatus::Stopped);
            return Err(AgentError::StartupTimeout(id.get(), self.startup_timeout));
        }

        self.supervisors.lock().unwrap().insert(id.clone(), stopper);
        self.transition(id, AgentStatus::Running);
        Ok(AgentStatus::Running)
    }

    /// Stops the supervised worker gracefully. A no-op for agents without a
    /// live supervisor.
    pub fn stop(&self, id: &AgentId) -> Result<AgentStatus, AgentError> {
        // hold the supervisor slot so a concurrent start cannot double-spawn
        let Some(stopper) = self.supervisors.lock().unwrap().remove(id) else {
            return self.get_status(id);
        };

        self.transition(id, AgentStatus::Stopping);
        stopper.stop()?;
        self.transition(id, AgentStatus::Stopped);
        Ok(AgentStatus::Stopped)
    }

    pub fn restart(&self, id: &AgentId) -> Result<AgentStatus, AgentError> {
        self.stop(id)?;
        self.start(id)
    }

    /// Forces the recorded status; used by `delete --force` on agents whose
    /// worker state is unknown (e.g. after an unclean control-plane exit).
    pub fn override_status(&self, id: &AgentId, status: AgentStatus) -> Result<(), AgentError> {
        self.get(id)?;
        self.transition(id, status);
        Ok(())
    }

    /// Stops every live supervisor; used during shutdown.
    pub fn stop_all(&self) {
        let stoppers: Vec<(AgentId, StopperOf<B>)> =
            self.supervisors.lock().unwrap().drain().collect();
        for (id, stopper) in stoppers {
            self.transition(&id, AgentStatus::Stopping);
            match stopper.stop() {
                Ok(()) => self.transition(&id, AgentStatus::Stopped),
                Err(err) => error!(agent_id = %id, "error stopping worker: {err}"),
            }
        }
    }

    /// Writes one frame to the agent's worker. False without a live worker.
    pub fn send_frame(&self, id: &AgentId, frame: &ControlFrame) -> bool {
        let supervisors = self.supervisors.lock().unwrap();
        let Some(stopper) = supervisors.get(id) else {
            return false;
        };
        let Ok(line) = frame.encode() else {
            return false;
        };
        stopper
            .send_line(&line)
            .inspect_err(|err| debug!(agent_id = %id, "frame not delivered: {err}"))
            .is_ok()
    }

    /// Applies one supervisor observation to the agent record and republishes
    /// it as a typed agent event.
    pub fn handle_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Ready(id) => {
                self.transition(&id, AgentStatus::Running);
            }
            SupervisorEvent::Crashed { id, exit_code } => {
                self.transition(&id, AgentStatus::Crashed);
                self.bus.publish(AgentEvent::AgentCrashed {
                    id: id.clone(),
                    exit_code,
                });
            }
            SupervisorEvent::Restarting(id) => {
                self.transition(&id, AgentStatus::Starting);
                self.bus.publish(AgentEvent::AgentRestarted(id));
            }
            SupervisorEvent::RestartsExhausted(id) => {
                // the supervision loop has ended; free the slot so a manual
                // start can spawn a fresh supervisor
                if let Some(stopper) = self.supervisors.lock().unwrap().remove(&id) {
                    if let Err(err) = stopper.stop() {
                        debug!(agent_id = %id, "error collecting exhausted supervisor: {err}");
                    }
                }
                self.transition(&id, AgentStatus::Crashed);
            }
            SupervisorEvent::Exited { id, exit_code } => {
                debug!(agent_id = %id, exit_code, "worker exited during controlled stop");
            }
            SupervisorEvent::Response { id, content, .. } => {
                self.bus.publish(AgentEvent::AgentResponse { id, content });
            }
            SupervisorEvent::Health(id, sample) => {
                if let Some(agent) = self.agents.lock().unwrap().get_mut(&id) {
                    agent.last_health_check = Some(Utc::now());
                }
                self.health.lock().unwrap().insert(id.clone(), sample.clone());
                self.bus.publish(AgentEvent::AgentHealth(id, sample));
            }
        }
    }

    fn spawn_supervised(&self, agent: &Agent) -> Result<StopperOf<B>, AgentError> {
        // invariant: at most one live subprocess per agent
        if self.supervisors.lock().unwrap().contains_key(&agent.id) {
            return Err(AgentError::StillRunning(agent.id.get()));
        }

        let starter = self.builder.build(agent)?;
        Ok(starter.start(self.supervisor_publisher.clone())?)
    }

    fn transition(&self, id: &AgentId, status: AgentStatus) {
        let mut agents = self.agents.lock().unwrap();
        let Some(agent) = agents.get_mut(id) else {
            return;
        };
        if agent.status == status {
            return;
        }
        agent.status = status;
        if let Err(err) = self.persist(&agents, Op::Update, id) {
            error!(agent_id = %id, "could not persist status change: {err}");
        }
        drop(agents);

        debug!(agent_id = %id, status = %status, "agent status changed");
        self.bus
            .publish(AgentEvent::AgentStatusChanged(id.clone(), status));
    }

    fn persist(
        &self,
        agents: &HashMap<AgentId, Agent>,
        op: Op,
        id: &AgentId,
    ) -> Result<(), AgentError> {
        let mut all: Vec<Agent> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        self.store
            .save_agents(&all, Mutation::new(op, Entity::Agent, id.get()))?;
        Ok(())
    }
}

impl<B> DeliverySink for Arc<AgentManager<B>>
where
    B: SupervisorBuilder + Send + Sync,
    StopperOf<B>: Send,
{
    fn deliver(&self, to: &AgentId, frame: &ControlFrame) -> bool {
        self.send_frame(to, frame)
    }
}

impl<B> AgentDirectory for AgentManager<B>
where
    B: SupervisorBuilder + Send + Sync,
    StopperOf<B>: Send,
{
    fn capabilities_of(&self, id: &AgentId) -> Option<BTreeSet<String>> {
        self.agents
            .lock()
            .unwrap()
            .get(id)
            .map(|agent| agent.capabilities.clone())
    }
}

/// Runs the supervisor event loop on its own thread until stopped.
pub fn start_event_loop<B>(
    manager: Arc<AgentManager<B>>,
    consumer: EventConsumer<SupervisorEvent>,
) -> StartedThreadContext
where
    B: SupervisorBuilder + Send + Sync + 'static,
    StopperOf<B>: Send,
{
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| loop {
        match consumer.as_ref().recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => manager.handle_supervisor_event(event),
            Err(RecvTimeoutError::Timeout) => {
                if stop_consumer.is_cancelled(Duration::ZERO) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    };
    NotStartedThreadContext::new("supervisor event loop", callback).start()
}
