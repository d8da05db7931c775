//! Command-line frontend: a thin translation layer over the control-plane
//! facade with typed exit codes.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::agent::definition::{AgentId, AgentPatch, AgentSpec, AgentStatus, WorkerCommand};
use crate::agent::error::AgentError;
use crate::broker::error::BrokerError;
use crate::broker::message::Priority;
use crate::control_plane::config::ControlPlaneConfig;
use crate::control_plane::control_plane::ControlPlane;
use crate::control_plane::error::ControlPlaneError;
use crate::event::channel::pub_sub;
use crate::event::ApplicationEvent;
use crate::task::error::TaskError;
use crate::task::task::{Requester, TaskSpec};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INVALID_ARGUMENTS: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;
pub const EXIT_CONFLICT: i32 = 4;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured working directory.
    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lays out the registry under the working directory.
    Init,
    /// Runs the control plane until interrupted.
    Serve,
    /// Prints the system status.
    Status,
    /// Prints the version.
    Version,
    /// Registers a new agent.
    AddAgent {
        id: String,
        prompt: String,
        /// Display name; defaults to the id.
        #[arg(long)]
        name: Option<String>,
        /// Worker binary to supervise.
        #[arg(long)]
        bin: Option<String>,
    },
    /// Lists agents.
    ListAgents {
        #[arg(long)]
        status: Option<String>,
        /// `table` or `json`.
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Shows one agent as JSON.
    ShowAgent { id: String },
    /// Replaces an agent's system prompt.
    UpdateAgent { id: String, prompt: String },
    /// Deletes an agent.
    DeleteAgent {
        id: String,
        /// Delete even when the worker state is unknown.
        #[arg(long)]
        force: bool,
    },
    /// Creates a task for an agent.
    CreateTask {
        agent_id: String,
        title: String,
        description: String,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Lists an agent's tasks.
    ListTasks { agent_id: String },
    /// Prints the aggregated task dashboard.
    TaskOverview,
    /// Prints registry counters.
    RegistryStatus,
    /// Prints the most recent journal entries.
    RegistryHistory {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Copies the registry tree to a destination directory.
    RegistryBackup { dest: PathBuf },
    /// Searches agents and tasks for a term.
    QueryRegistry { term: String },
}

impl Cli {
    pub fn init_cli() -> Self {
        Self::parse()
    }
}

/// Executes the parsed command line and returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    match execute(cli) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("Error: {}: {err}", kind_of(&err));
            exit_code_of(&err)
        }
    }
}

fn execute(cli: Cli) -> Result<(), ControlPlaneError> {
    if let Command::Version = cli.command {
        println!("nox {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = ControlPlaneConfig::load_or_default(cli.config.as_deref())?;
    if let Some(working_dir) = cli.working_dir {
        config = config.with_working_dir(working_dir);
    }
    let control_plane = ControlPlane::new(config)?;

    match cli.command {
        Command::Version => unreachable!("handled above"),
        Command::Init => {
            println!(
                "initialized registry at {}",
                control_plane.registry_status()?.path.display()
            );
        }
        Command::Serve => {
            let (application_publisher, application_consumer) = pub_sub();
            ctrlc::set_handler(move || {
                let _ = application_publisher.publish(ApplicationEvent::StopRequested);
            })
            .expect("signal handler can be registered once");
            control_plane.run(application_consumer)?;
        }
        Command::Status => {
            control_plane.load()?;
            let status = control_plane.system_status();
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
        }
        Command::AddAgent {
            id,
            prompt,
            name,
            bin,
        } => {
            control_plane.load()?;
            let agent = control_plane.create_agent(AgentSpec {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                system_prompt: prompt,
                command: bin.map(WorkerCommand::new).unwrap_or_default(),
                resource_limits: Default::default(),
                capabilities: BTreeSet::new(),
            })?;
            println!("created agent {}", agent.id);
        }
        Command::ListAgents { status, format } => {
            control_plane.load()?;
            let status = status.as_deref().map(parse_status).transpose()?;
            let agents = control_plane.list_agents(status);
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&agents).unwrap());
            } else {
                for agent in agents {
                    println!("{:<24} {:<10} {}", agent.id, agent.status, agent.name);
                }
            }
        }
        Command::ShowAgent { id } => {
            control_plane.load()?;
            let agent = control_plane.get_agent(&parse_agent_id(&id)?)?;
            println!("{}", serde_json::to_string_pretty(&agent).unwrap());
        }
        Command::UpdateAgent { id, prompt } => {
            control_plane.load()?;
            control_plane.update_agent(
                &parse_agent_id(&id)?,
                AgentPatch {
                    system_prompt: Some(prompt),
                    ..AgentPatch::default()
                },
            )?;
            println!("updated agent {id}");
        }
        Command::DeleteAgent { id, force } => {
            control_plane.load()?;
            let id = parse_agent_id(&id)?;
            if force {
                control_plane.force_delete_agent(&id)?;
            } else {
                control_plane.delete_agent(&id)?;
            }
            println!("deleted agent {id}");
        }
        Command::CreateTask {
            agent_id,
            title,
            description,
            priority,
        } => {
            control_plane.load()?;
            let agent_id = parse_agent_id(&agent_id)?;
            // the owner must exist
            control_plane.get_agent(&agent_id)?;
            let task = control_plane.create_task(TaskSpec {
                agent_id,
                title,
                description,
                priority: priority.as_deref().map(parse_priority).transpose()?.unwrap_or_default(),
                requested_by: Requester::User,
                dependencies: BTreeSet::new(),
            })?;
            println!("created task {}", task.id);
        }
        Command::ListTasks { agent_id } => {
            control_plane.load()?;
            for task in control_plane.agent_tasks(&parse_agent_id(&agent_id)?) {
                println!("{:<28} {:<12} {:>3}% {}", task.id, task.status, task.progress, task.title);
            }
        }
        Command::TaskOverview => {
            control_plane.load()?;
            let dashboard = control_plane.task_dashboard();
            println!("{}", serde_json::to_string_pretty(&dashboard).unwrap());
        }
        Command::RegistryStatus => {
            let status = control_plane.registry_status()?;
            println!("registry:          {}", status.path.display());
            println!("agents:            {}", status.agents);
            println!("tasks:             {}", status.tasks);
            println!("pending approvals: {}", status.pending_approvals);
            println!(
                "journal:           {}",
                if status.journal_degraded { "degraded" } else { "ok" }
            );
        }
        Command::RegistryHistory { limit } => {
            for line in control_plane.registry_history(limit)? {
                println!("{line}");
            }
        }
        Command::RegistryBackup { dest } => {
            let copied = control_plane.registry_backup(&dest)?;
            println!("copied {copied} files to {}", dest.display());
        }
        Command::QueryRegistry { term } => {
            control_plane.load()?;
            for hit in control_plane.query_registry(&term)? {
                println!("{hit}");
            }
        }
    }
    Ok(())
}

fn parse_agent_id(raw: &str) -> Result<AgentId, ControlPlaneError> {
    AgentId::new(raw).map_err(|err| AgentError::InvalidSpec(err.into()).into())
}

fn parse_status(raw: &str) -> Result<AgentStatus, ControlPlaneError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| TaskError::InvalidSpec(format!("`{raw}` is not an agent status")).into())
}

fn parse_priority(raw: &str) -> Result<Priority, ControlPlaneError> {
    serde_json::from_value(serde_json::Value::String(raw.to_uppercase())).map_err(|_| {
        TaskError::InvalidSpec(format!("`{raw}` is not a priority")).into()
    })
}

fn kind_of(err: &ControlPlaneError) -> &'static str {
    match err {
        ControlPlaneError::Agent(agent) => match agent {
            AgentError::InvalidSpec(_) => "InvalidSpec",
            AgentError::DuplicateId(_) => "DuplicateId",
            AgentError::AgentNotFound(_) => "AgentNotFound",
            AgentError::StillRunning(_) => "StillRunning",
            AgentError::StartupTimeout(_, _) => "Timeout",
            AgentError::Supervisor(_) => "SpawnFailed",
            AgentError::Store(_) => "StorageIO",
        },
        ControlPlaneError::Task(task) => match task {
            TaskError::TaskNotFound(_) => "TaskNotFound",
            TaskError::InvalidSpec(_) => "InvalidSpec",
            TaskError::IllegalTransition { .. } => "IllegalTransition",
            TaskError::CycleDetected(_) => "CycleDetected",
            TaskError::Delegation(_) => "QueueFull",
            TaskError::Store(_) => "StorageIO",
        },
        ControlPlaneError::Approval(approval) => match approval {
            crate::approval::error::ApprovalError::ApprovalNotFound(_) => "ApprovalNotFound",
            crate::approval::error::ApprovalError::Store(_) => "StorageIO",
        },
        ControlPlaneError::Broker(broker) => match broker {
            BrokerError::QueueFull(_) => "QueueFull",
            BrokerError::SelfAddressed(_) => "InvalidSpec",
            BrokerError::ShuttingDown => "Cancelled",
            BrokerError::Store(_) => "StorageIO",
        },
        ControlPlaneError::Store(_) => "StorageIO",
        ControlPlaneError::Config(_) => "InvalidSpec",
        ControlPlaneError::Server(_) => "External",
        ControlPlaneError::ShuttingDown => "Cancelled",
    }
}

fn exit_code_of(err: &ControlPlaneError) -> i32 {
    match err {
        ControlPlaneError::Agent(agent) => match agent {
            AgentError::InvalidSpec(_) => EXIT_INVALID_ARGUMENTS,
            AgentError::AgentNotFound(_) => EXIT_NOT_FOUND,
            AgentError::DuplicateId(_) | AgentError::StillRunning(_) => EXIT_CONFLICT,
            _ => EXIT_FAILURE,
        },
        ControlPlaneError::Task(task) => match task {
            TaskError::InvalidSpec(_) | TaskError::CycleDetected(_) => EXIT_INVALID_ARGUMENTS,
            TaskError::TaskNotFound(_) => EXIT_NOT_FOUND,
            TaskError::IllegalTransition { .. } => EXIT_CONFLICT,
            _ => EXIT_FAILURE,
        },
        ControlPlaneError::Approval(approval) => match approval {
            crate::approval::error::ApprovalError::ApprovalNotFound(_) => EXIT_NOT_FOUND,
            _ => EXIT_FAILURE,
        },
        ControlPlaneError::Config(_) => EXIT_INVALID_ARGUMENTS,
        _ => EXIT_FAILURE,
    }
}
