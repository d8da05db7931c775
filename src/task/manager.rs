use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::agent::definition::AgentId;
use crate::broker::broker::MessageBroker;
use crate::broker::handlers::TASK_ID_METADATA_KEY;
use crate::broker::message::{Message, MessageType, Priority};
use crate::event::{EventBus, TaskEvent};
use crate::registry::journal::Op;
use crate::registry::store::RegistryStore;

use super::error::TaskError;
use super::graph::would_create_cycle;
use super::task::{Requester, Task, TaskId, TaskPatch, TaskSpec, TaskStatus};

pub const DEPENDENCY_CANCELLED_REASON: &str = "dependency cancelled";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TaskFilter {
    pub agent_id: Option<AgentId>,
    pub status: Option<TaskStatus>,
}

/// Aggregated snapshot, computed under a single read guard.
#[derive(Debug, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskDashboard {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_agent: BTreeMap<String, usize>,
    pub blocked_count: usize,
    pub oldest_open_age_sec: Option<u64>,
}

/// Payload of `delegate`: the task agent A asks agent B to take on.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationSpec {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub dependencies: BTreeSet<TaskId>,
}

/// The task graph and its transitions. Single mutator: every status change
/// funnels through this manager.
pub struct TaskManager {
    tasks: Mutex<HashMap<TaskId, Task>>,
    store: Arc<RegistryStore>,
    broker: Arc<MessageBroker>,
    bus: EventBus,
}

impl TaskManager {
    pub fn new(store: Arc<RegistryStore>, broker: Arc<MessageBroker>, bus: EventBus) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            store,
            broker,
            bus,
        }
    }

    /// Loads persisted tasks into the in-memory graph. Returns the count.
    pub fn load_from_store(&self) -> Result<usize, TaskError> {
        let loaded = self.store.load_tasks()?;
        let mut tasks = self.tasks.lock().unwrap();
        let count = loaded.len();
        for task in loaded {
            tasks.insert(task.id, task);
        }
        Ok(count)
    }

    pub fn create(&self, spec: TaskSpec) -> Result<Task, TaskError> {
        if spec.title.is_empty() {
            return Err(TaskError::InvalidSpec("title must not be empty".into()));
        }

        let mut tasks = self.tasks.lock().unwrap();
        check_dependencies(&tasks, &spec.dependencies)?;

        let id = TaskId::new();
        let status = if all_dependencies_done(&tasks, &spec.dependencies) {
            TaskStatus::Todo
        } else {
            TaskStatus::Blocked
        };
        let task = Task {
            id,
            agent_id: spec.agent_id,
            title: spec.title,
            description: spec.description,
            status,
            priority: spec.priority,
            requested_by: spec.requested_by,
            dependencies: spec.dependencies,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };

        self.store.save_task(&task, Op::Create)?;
        tasks.insert(id, task.clone());
        drop(tasks);

        debug!(task_id = %id, "task created");
        self.bus.publish(TaskEvent::TaskCreated(id));
        Ok(task)
    }

    pub fn get(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.tasks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let tasks = self.tasks.lock().unwrap();
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|task| {
                filter
                    .agent_id
                    .as_ref()
                    .map_or(true, |agent| task.agent_id == *agent)
                    && filter.status.map_or(true, |status| task.status == status)
            })
            .cloned()
            .collect();
        result.sort_by_key(|task| task.id);
        result
    }

    pub fn get_agent_tasks(&self, agent_id: &AgentId) -> Vec<Task> {
        self.list(&TaskFilter {
            agent_id: Some(agent_id.clone()),
            status: None,
        })
    }

    pub fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut updated = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;
        let previous_status = updated.status;

        if let Some(title) = patch.title {
            if title.is_empty() {
                return Err(TaskError::InvalidSpec("title must not be empty".into()));
            }
            updated.title = title;
        }
        if let Some(description) = patch.description {
            updated.description = description;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        if let Some(result) = patch.result {
            updated.result = Some(result);
        }
        if let Some(error) = patch.error {
            updated.error = Some(error);
        }

        if let Some(dependencies) = patch.dependencies {
            check_dependencies(&tasks, &dependencies)?;
            if would_create_cycle(&tasks, *id, &dependencies) {
                return Err(TaskError::CycleDetected(id.to_string()));
            }
            updated.dependencies = dependencies;
            reconcile_with_dependencies(&tasks, &mut updated);
        }

        if let Some(target) = patch.status {
            apply_transition(&tasks, &mut updated, target)?;
        }

        if let Some(progress) = patch.progress {
            if progress > 100 {
                return Err(TaskError::InvalidSpec("progress must be 0..=100".into()));
            }
            if (progress == 100) != (updated.status == TaskStatus::Done) {
                return Err(TaskError::InvalidSpec(
                    "progress 100 and status done imply each other".into(),
                ));
            }
            updated.progress = progress;
        }

        self.store.save_task(&updated, Op::Update)?;
        tasks.insert(*id, updated.clone());

        let became_done =
            previous_status != TaskStatus::Done && updated.status == TaskStatus::Done;
        let became_cancelled =
            previous_status != TaskStatus::Cancelled && updated.status == TaskStatus::Cancelled;

        let unblocked = if became_done {
            self.unblock_ready(&mut tasks)?
        } else {
            Vec::new()
        };
        let cascaded = if became_cancelled {
            self.block_dependents(&mut tasks, id)?
        } else {
            Vec::new()
        };
        drop(tasks);

        self.bus.publish(TaskEvent::TaskUpdated(*id));
        if became_done {
            self.bus.publish(TaskEvent::TaskCompleted(*id));
        }
        if became_cancelled {
            self.bus.publish(TaskEvent::TaskCancelled(*id));
        }
        for task_id in unblocked.into_iter().chain(cascaded) {
            self.bus.publish(TaskEvent::TaskUpdated(task_id));
        }
        Ok(updated)
    }

    pub fn delete(&self, id: &TaskId) -> Result<(), TaskError> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.remove(id).is_none() {
            return Err(TaskError::TaskNotFound(id.to_string()));
        }
        self.store.delete_task(&id.to_string())?;
        let cascaded = self.block_dependents(&mut tasks, id)?;
        drop(tasks);

        info!(task_id = %id, "task deleted");
        for task_id in cascaded {
            self.bus.publish(TaskEvent::TaskUpdated(task_id));
        }
        Ok(())
    }

    /// Creates a task owned by `to` on behalf of `from`, atomically with the
    /// `task_request` message announcing it. No message, no task.
    pub fn delegate(
        &self,
        from: AgentId,
        to: AgentId,
        spec: DelegationSpec,
    ) -> Result<Task, TaskError> {
        if spec.title.is_empty() {
            return Err(TaskError::InvalidSpec("title must not be empty".into()));
        }

        let mut tasks = self.tasks.lock().unwrap();
        check_dependencies(&tasks, &spec.dependencies)?;

        let id = TaskId::new();
        let message = Message::new(
            from.clone(),
            to.clone(),
            MessageType::TaskRequest,
            format!("{}: {}", spec.title, spec.description),
        )
        .with_priority(spec.priority)
        .with_metadata(TASK_ID_METADATA_KEY, id.to_string());
        self.broker.send_message(message)?;

        let status = if all_dependencies_done(&tasks, &spec.dependencies) {
            TaskStatus::Todo
        } else {
            TaskStatus::Blocked
        };
        let task = Task {
            id,
            agent_id: to.clone(),
            title: spec.title,
            description: spec.description,
            status,
            priority: spec.priority,
            requested_by: Requester::Agent(from.clone()),
            dependencies: spec.dependencies,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        self.store.save_task(&task, Op::Create)?;
        tasks.insert(id, task.clone());
        drop(tasks);

        info!(task_id = %id, from = %from, to = %to, "task delegated");
        self.bus.publish(TaskEvent::TaskCreated(id));
        self.bus.publish(TaskEvent::TaskDelegated {
            task_id: id,
            from,
            to,
        });
        Ok(task)
    }

    pub fn complete(&self, id: &TaskId, result: Option<String>) -> Result<Task, TaskError> {
        self.update(
            id,
            TaskPatch {
                status: Some(TaskStatus::Done),
                result,
                ..TaskPatch::default()
            },
        )
    }

    pub fn cancel(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.update(
            id,
            TaskPatch {
                status: Some(TaskStatus::Cancelled),
                ..TaskPatch::default()
            },
        )
    }

    /// Cancels every non-terminal task owned by `agent_id`; part of agent
    /// deletion. Returns the number of cancelled tasks.
    pub fn cancel_agent_tasks(&self, agent_id: &AgentId) -> Result<usize, TaskError> {
        let open: Vec<TaskId> = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .values()
                .filter(|task| task.agent_id == *agent_id && !task.status.is_terminal())
                .map(|task| task.id)
                .collect()
        };

        let count = open.len();
        for id in open {
            self.cancel(&id)?;
        }
        Ok(count)
    }

    pub fn dashboard(&self) -> TaskDashboard {
        let tasks = self.tasks.lock().unwrap();

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_priority: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_agent: BTreeMap<String, usize> = BTreeMap::new();
        let mut oldest_open = None;

        for task in tasks.values() {
            *by_status.entry(task.status.to_string()).or_default() += 1;
            *by_priority
                .entry(format!("{:?}", task.priority).to_uppercase())
                .or_default() += 1;
            *by_agent.entry(task.agent_id.get()).or_default() += 1;

            if !task.status.is_terminal() {
                oldest_open = match oldest_open {
                    None => Some(task.created_at),
                    Some(current) if task.created_at < current => Some(task.created_at),
                    keep => keep,
                };
            }
        }

        TaskDashboard {
            total: tasks.len(),
            blocked_count: by_status.get("blocked").copied().unwrap_or(0),
            by_status,
            by_priority,
            by_agent,
            oldest_open_age_sec: oldest_open
                .map(|at| (Utc::now() - at).num_seconds().max(0) as u64),
        }
    }

    /// Moves every blocked task whose dependencies are all done to
    /// inprogress. Called whenever a task reaches `done`.
    fn unblock_ready(
        &self,
        tasks: &mut HashMap<TaskId, Task>,
    ) -> Result<Vec<TaskId>, TaskError> {
        let ready: Vec<TaskId> = tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Blocked
                    && all_dependencies_done(tasks, &task.dependencies)
            })
            .map(|task| task.id)
            .collect();

        for id in &ready {
            let task = tasks.get_mut(id).expect("collected above");
            task.status = TaskStatus::InProgress;
            task.started_at.get_or_insert_with(Utc::now);
            task.error = None;
            self.store.save_task(task, Op::Update)?;
            debug!(task_id = %id, "task unblocked");
        }
        Ok(ready)
    }

    /// Blocks every non-terminal task depending on `cancelled`, with the
    /// cancellation reason recorded.
    fn block_dependents(
        &self,
        tasks: &mut HashMap<TaskId, Task>,
        cancelled: &TaskId,
    ) -> Result<Vec<TaskId>, TaskError> {
        let dependents: Vec<TaskId> = tasks
            .values()
            .filter(|task| {
                !task.status.is_terminal() && task.dependencies.contains(cancelled)
            })
            .map(|task| task.id)
            .collect();

        for id in &dependents {
            let task = tasks.get_mut(id).expect("collected above");
            task.status = TaskStatus::Blocked;
            task.error = Some(DEPENDENCY_CANCELLED_REASON.to_string());
            self.store.save_task(task, Op::Update)?;
            debug!(task_id = %id, "task blocked on cancelled dependency");
        }
        Ok(dependents)
    }
}

fn check_dependencies(
    tasks: &HashMap<TaskId, Task>,
    dependencies: &BTreeSet<TaskId>,
) -> Result<(), TaskError> {
    for dependency in dependencies {
        if !tasks.contains_key(dependency) {
            return Err(TaskError::TaskNotFound(dependency.to_string()));
        }
    }
    Ok(())
}

fn all_dependencies_done(tasks: &HashMap<TaskId, Task>, dependencies: &BTreeSet<TaskId>) -> bool {
    dependencies.iter().all(|dependency| {
        tasks
            .get(dependency)
            .is_some_and(|task| task.status == TaskStatus::Done)
    })
}

/// The status machine. `Todo -> InProgress` with unmet dependencies routes to
/// `Blocked` instead of failing; everything else off the machine is an
/// `IllegalTransition`.
fn apply_transition(
    tasks: &HashMap<TaskId, Task>,
    task: &mut Task,
    target: TaskStatus,
) -> Result<(), TaskError> {
    use TaskStatus::*;

    let from = task.status;
    if from == target {
        return Ok(());
    }

    match (from, target) {
        (Todo, InProgress) => {
            if all_dependencies_done(tasks, &task.dependencies) {
                task.status = InProgress;
                task.started_at.get_or_insert_with(Utc::now);
            } else {
                task.status = Blocked;
            }
        }
        (Blocked, InProgress) => {
            if !all_dependencies_done(tasks, &task.dependencies) {
                return Err(TaskError::IllegalTransition { from, to: target });
            }
            task.status = InProgress;
            task.started_at.get_or_insert_with(Utc::now);
        }
        (Todo, Blocked) | (InProgress, Blocked) => task.status = Blocked,
        (InProgress, Done) => {
            task.status = Done;
            task.progress = 100;
            task.completed_at = Some(Utc::now());
        }
        (Todo, Cancelled) | (InProgress, Cancelled) | (Blocked, Cancelled) => {
            task.status = Cancelled;
            task.completed_at = Some(Utc::now());
        }
        _ => return Err(TaskError::IllegalTransition { from, to: target }),
    }
    Ok(())
}

fn reconcile_with_dependencies(tasks: &HashMap<TaskId, Task>, task: &mut Task) {
    let met = all_dependencies_done(tasks, &task.dependencies);
    match task.status {
        TaskStatus::Todo if !met => task.status = TaskStatus::Blocked,
        TaskStatus::Blocked if met => {
            task.status = TaskStatus::InProgress;
            task.started_at.get_or_insert_with(Utc::now);
            task.error = None;
        }
        _ => {}
    }
}
