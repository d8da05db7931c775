//! End-to-end scenarios driven through the control-plane facade, with real
//! worker processes where the lifecycle needs them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;

use nox::agent::definition::{AgentId, AgentSpec, AgentStatus, WorkerCommand};
use nox::agent::error::AgentError;
use nox::broker::history::HistoryEntry;
use nox::broker::message::{MessageType, Priority};
use nox::control_plane::config::ControlPlaneConfig;
use nox::control_plane::control_plane::ControlPlane;
use nox::control_plane::error::ControlPlaneError;
use nox::server::config::ServerConfig;
use nox::task::manager::DelegationSpec;
use nox::task::task::{Requester, TaskPatch, TaskSpec, TaskStatus};

fn id(s: &str) -> AgentId {
    AgentId::new(s).unwrap()
}

fn control_plane() -> (Arc<ControlPlane>, TempDir) {
    let dir = TempDir::new().unwrap();
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

/// A worker that reports ready and then idles until terminated.
fn ready_worker() -> WorkerCommand {
    WorkerCommand::new("sh").with_args(vec![
        "-c".to_string(),
        "echo '{\"kind\":\"ready\"}'; exec sleep 60".to_string(),
    ])
}

fn spec(agent_id: &str, command: WorkerCommand) -> AgentSpec {
    AgentSpec {
        id: agent_id.to_string(),
        name: format!("{agent_id} worker"),
        system_prompt: "you are a worker".to_string(),
        command,
        resource_limits: Default::default(),
        capabilities: BTreeSet::from(["echo".to_string()]),
    }
}

fn task_spec(agent: &str, title: &str) -> TaskSpec {
    TaskSpec {
        agent_id: id(agent),
        title: title.to_string(),
        description: "test".to_string(),
        priority: Priority::Medium,
        requested_by: Requester::User,
        dependencies: BTreeSet::new(),
    }
}

fn wait_for_history<F>(
    control_plane: &Arc<ControlPlane>,
    agent: &AgentId,
    predicate: F,
) -> Vec<HistoryEntry>
where
    F: Fn(&[HistoryEntry]) -> bool,
{
    for _ in 0..200 {
        let entries = control_plane.message_history(agent, 100, true);
        if predicate(&entries) {
            return entries;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("message history for {agent} never matched");
}

#[cfg(unix)]
#[test]
fn agent_crud_lifecycle() {
    let (control_plane, _dir) = control_plane();

    let created = control_plane
        .create_agent(spec("alpha", ready_worker()))
        .unwrap();
    assert_eq!(created.status, AgentStatus::Inactive);
    assert_eq!(control_plane.get_agent(&id("alpha")).unwrap(), created);

    assert_eq!(
        control_plane.start_agent(&id("alpha")).unwrap(),
        AgentStatus::Running
    );
    // starting a running agent is a no-op
    assert_eq!(
        control_plane.start_agent(&id("alpha")).unwrap(),
        AgentStatus::Running
    );

    assert_matches!(
        control_plane.delete_agent(&id("alpha")),
        Err(ControlPlaneError::Agent(AgentError::StillRunning(_)))
    );

    assert_eq!(
        control_plane.stop_agent(&id("alpha")).unwrap(),
        AgentStatus::Stopped
    );
    control_plane.delete_agent(&id("alpha")).unwrap();
    assert_matches!(
        control_plane.delete_agent(&id("alpha")),
        Err(ControlPlaneError::Agent(AgentError::AgentNotFound(_)))
    );

    control_plane.shutdown();
}

#[test]
fn delegation_with_dependencies() {
    let (control_plane, _dir) = control_plane();

    control_plane
        .create_agent(spec("beta", WorkerCommand::default()))
        .unwrap();
    control_plane
        .create_agent(spec("gamma", WorkerCommand::default()))
        .unwrap();

    // T1 owned by beta, in progress
    let t1 = control_plane.create_task(task_spec("beta", "T1")).unwrap();
    control_plane
        .update_task(
            &t1.id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                ..TaskPatch::default()
            },
        )
        .unwrap();

    // beta delegates T2 to gamma, blocked on T1
    let t2 = control_plane
        .delegate_task(
            id("beta"),
            id("gamma"),
            DelegationSpec {
                title: "T2".to_string(),
                description: "subtask".to_string(),
                priority: Priority::High,
                dependencies: BTreeSet::from([t1.id]),
            },
        )
        .unwrap();
    assert_eq!(t2.status, TaskStatus::Blocked);
    assert_eq!(t2.requested_by, Requester::Agent(id("beta")));

    // the delegation message reaches gamma's history
    let entries = wait_for_history(&control_plane, &id("gamma"), |entries| {
        entries
            .iter()
            .any(|entry| entry.message.message_type == MessageType::TaskRequest)
    });
    let request = entries
        .iter()
        .find(|entry| entry.message.message_type == MessageType::TaskRequest)
        .unwrap();
    assert_eq!(request.message.from, id("beta"));
    assert_eq!(
        request.message.metadata.get("taskId").unwrap(),
        &t2.id.to_string()
    );

    // completing T1 unblocks T2
    control_plane
        .complete_task(&t1.id, Some("done".to_string()))
        .unwrap();
    assert_eq!(
        control_plane.get_task(&t2.id).unwrap().status,
        TaskStatus::InProgress
    );

    control_plane.shutdown();
}

#[test]
fn capability_query_is_answered_from_declared_capabilities() {
    let (control_plane, _dir) = control_plane();

    control_plane
        .create_agent(spec("asker", WorkerCommand::default()))
        .unwrap();
    control_plane
        .create_agent(spec("oracle", WorkerCommand::default()))
        .unwrap();

    control_plane
        .send_message(nox::broker::message::Message::new(
            id("asker"),
            id("oracle"),
            MessageType::CapabilityQuery,
            "echo",
        ))
        .unwrap();

    // the handler reply lands in the asker's history as a direct message
    let entries = wait_for_history(&control_plane, &id("asker"), |entries| {
        entries
            .iter()
            .any(|entry| entry.message.message_type == MessageType::Direct)
    });
    let reply = entries
        .iter()
        .find(|entry| entry.message.message_type == MessageType::Direct)
        .unwrap();
    assert_eq!(reply.message.content, "echo");
    assert!(reply.message.reply_to.is_some());

    control_plane.shutdown();
}

#[cfg(unix)]
#[test]
fn restart_survives_a_worker_generation() {
    let (control_plane, _dir) = control_plane();

    control_plane
        .create_agent(spec("alpha", ready_worker()))
        .unwrap();
    assert_eq!(
        control_plane.start_agent(&id("alpha")).unwrap(),
        AgentStatus::Running
    );
    assert_eq!(
        control_plane.restart_agent(&id("alpha")).unwrap(),
        AgentStatus::Running
    );

    control_plane.stop_agent(&id("alpha")).unwrap();
    control_plane.shutdown();
}

#[test]
fn priority_preempts_at_the_default_worker_count() {
    use nox::broker::broker::{BrokerConfig, DeliverySink, MessageBroker};
    use nox::broker::handlers::ProtocolRegistry;
    use nox::broker::message::Message;
    use nox::broker::subscription::Subscription;
    use nox::registry::store::RegistryStore;
    use std::sync::mpsc::{channel, Sender};

    struct RecordingSink(Sender<String>);

    impl DeliverySink for RecordingSink {
        fn deliver(&self, _: &AgentId, frame: &nox::agent::wire::ControlFrame) -> bool {
            let nox::agent::wire::ControlFrame::Message { content, .. } = frame else {
                return false;
            };
            self.0.send(content.clone()).is_ok()
        }
    }

    let dir = TempDir::new().unwrap();
    let store = Arc::new(RegistryStore::open(dir.path()).unwrap());
    let (tx, rx) = channel();

    // the production-default pool size, no overrides
    let broker = MessageBroker::new(
        BrokerConfig::default(),
        ProtocolRegistry::new(),
        Box::new(RecordingSink(tx)),
        store,
        nox::event::EventBus::default(),
    );
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
    broker.start();

    let mut delivered = Vec::new();
    for _ in 0..3 {
        delivered.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(delivered, vec!["critical", "medium", "low"]);

    broker.shutdown();
}

#[test]
fn state_survives_a_control_plane_restart() {
    let dir = TempDir::new().unwrap();
    let config = || {
        ControlPlaneConfig {
            server: ServerConfig {
                enabled: false,
                ..ServerConfig::default()
            },
            ..ControlPlaneConfig::default()
        }
        .with_working_dir(dir.path().to_path_buf())
    };

    let first = ControlPlane::new(config()).unwrap();
    first.start().unwrap();
    first
        .create_agent(spec("alpha", WorkerCommand::default()))
        .unwrap();
    let task = first.create_task(task_spec("alpha", "persisted")).unwrap();
    first.shutdown();

    let second = ControlPlane::new(config()).unwrap();
    second.start().unwrap();
    assert_eq!(second.list_agents(None).len(), 1);
    assert_eq!(second.get_task(&task.id).unwrap().title, "persisted");
    second.shutdown();
}
