use std::process::ExitStatus;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::agent::definition::{AgentId, WorkerCommand};
use crate::agent::wire::{WorkerFrame, WorkerOutput};
use crate::context::Context;
use crate::event::channel::EventPublisher;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use crate::utils::threads::spawn_named_thread;

use super::command::{AgentCommand, StdinHandle, Unstarted};
use super::error::{CommandError, SupervisorError};
use super::health::{spawn_health_monitor, HealthSample, HealthThresholds, ProcessHealthChecker};
use super::restart::RestartPolicy;
use super::shutdown::{wait_exit_timeout, ProcessTerminator};
use super::stream::OutputEvent;
use super::{SupervisorStarter, SupervisorStopper};

/// Events published by a running supervisor. Consumed by the Agent Manager,
/// which owns the status transitions they imply.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// The worker sent its `ready` frame.
    Ready(AgentId),
    /// The worker produced a `response` frame.
    Response {
        id: AgentId,
        content: String,
        reply_to: Option<String>,
    },
    /// Controlled exit during an explicit stop.
    Exited { id: AgentId, exit_code: i32 },
    /// Uncontrolled exit.
    Crashed { id: AgentId, exit_code: i32 },
    /// A crashed worker is being re-spawned after backoff.
    Restarting(AgentId),
    /// The restart budget for the rolling window is exhausted; auto-restart
    /// is suspended until manual intervention.
    RestartsExhausted(AgentId),
    Health(AgentId, HealthSample),
}

pub struct NotStartedSupervisor {
    pub(super) agent_id: AgentId,
    pub(super) worker: WorkerCommand,
    pub(super) restart_policy: RestartPolicy,
    pub(super) thresholds: HealthThresholds,
    pub(super) check_interval: Duration,
    pub(super) stop_grace: Duration,
    pub(super) ctx: Context<bool>,
}

pub struct StartedSupervisor {
    agent_id: AgentId,
    ctx: Context<bool>,
    ready_ctx: Context<bool>,
    stdin: StdinHandle,
    thread_contexts: Vec<StartedThreadContext>,
    join_handles: Vec<JoinHandle<()>>,
}

impl NotStartedSupervisor {
    pub fn new(agent_id: AgentId, worker: WorkerCommand) -> Self {
        Self {
            agent_id,
            worker,
            restart_policy: RestartPolicy::default(),
            thresholds: HealthThresholds::default(),
            check_interval: super::health::DEFAULT_CHECK_INTERVAL,
            stop_grace: Duration::from_secs(10),
            ctx: Context::new(),
        }
    }

    pub fn with_restart_policy(self, restart_policy: RestartPolicy) -> Self {
        Self {
            restart_policy,
            ..self
        }
    }

    pub fn with_health(self, thresholds: HealthThresholds, check_interval: Duration) -> Self {
        Self {
            thresholds,
            check_interval,
            ..self
        }
    }

    pub fn with_stop_grace(self, stop_grace: Duration) -> Self {
        Self { stop_grace, ..self }
    }

    fn start_process_thread(
        self,
        publisher: EventPublisher<SupervisorEvent>,
        out_tx: Sender<OutputEvent>,
        current_pid: Arc<Mutex<Option<u32>>>,
        stdin: StdinHandle,
        ready_ctx: Context<bool>,
        shutdown_ctx: Context<bool>,
    ) -> StartedThreadContext {
        let mut restart_policy = self.restart_policy.clone();
        let agent_id = self.agent_id.clone();
        let worker = self.worker.clone();
        let ctx = self.ctx.clone();

        // The thread context's own stop consumer is unused: this loop is
        // cancelled through `ctx` so the termination listener can also see it.
        let callback = move |_| loop {
            // holds the pid lock during spawn so the termination listener
            // cannot observe a half-started process
            let pid_guard = current_pid.lock().unwrap();

            if ctx.is_cancelled() {
                debug!(agent_id = %agent_id, "supervisor stopped before starting the process");
                break;
            }

            info!(agent_id = %agent_id, bin = worker.bin, "starting worker process");

            ready_ctx.reset().unwrap();
            shutdown_ctx.reset().unwrap();

            let not_started = AgentCommand::new(&worker);
            let exit_code = start_command(not_started, pid_guard, &stdin, out_tx.clone())
                .map(exit_code_of)
                .unwrap_or_else(|err| {
                    error!(agent_id = %agent_id, "error while launching worker process: {err}");
                    -1
                });

            // canceling the shutdown ctx must happen before taking the pid
            // lock again, the termination listener may be blocked on it
            stdin.replace(None);
            shutdown_ctx.cancel_all(true).unwrap();
            *current_pid.lock().unwrap() = None;

            if ctx.is_cancelled() {
                info!(agent_id = %agent_id, "worker stopped and process terminated");
                let _ = publisher.publish(SupervisorEvent::Exited {
                    id: agent_id.clone(),
                    exit_code,
                });
                break;
            }

            error!(agent_id = %agent_id, exit_code, "worker process exited unexpectedly");
            let _ = publisher.publish(SupervisorEvent::Crashed {
                id: agent_id.clone(),
                exit_code,
            });

            if !restart_policy.should_retry() {
                warn!(agent_id = %agent_id, "worker exceeded its restart budget, suspending auto-restart");
                let _ = publisher.publish(SupervisorEvent::RestartsExhausted(agent_id.clone()));
                break;
            }

            let _ = publisher.publish(SupervisorEvent::Restarting(agent_id.clone()));
            restart_policy.backoff(|duration| {
                // early exit when the supervisor is stopped mid-backoff
                wait_exit_timeout(ctx.clone(), duration);
            });
        };

        NotStartedThreadContext::new(format!("worker loop {}", self.worker.bin), callback).start()
    }
}

impl SupervisorStarter for NotStartedSupervisor {
    type Stopper = StartedSupervisor;

    fn start(
        self,
        publisher: EventPublisher<SupervisorEvent>,
    ) -> Result<Self::Stopper, SupervisorError> {
        let agent_id = self.agent_id.clone();
        let ctx = self.ctx.clone();
        let ready_ctx = Context::<bool>::new();
        let shutdown_ctx = Context::<bool>::new();
        let current_pid: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        let last_output: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let stdin = StdinHandle::new();

        let termination_handle = wait_for_termination(
            current_pid.clone(),
            ctx.clone(),
            shutdown_ctx.clone(),
            self.stop_grace,
        );

        let (out_tx, out_rx) = std::sync::mpsc::channel();
        let router_handle = spawn_output_router(
            agent_id.clone(),
            out_rx,
            last_output.clone(),
            ready_ctx.clone(),
            publisher.clone(),
        );

        let checker =
            ProcessHealthChecker::new(current_pid.clone(), last_output, self.thresholds.clone());
        let health_context = spawn_health_monitor(
            agent_id.clone(),
            checker,
            publisher.clone(),
            self.check_interval,
        );

        let stdin_clone = stdin.clone();
        let process_context = self.start_process_thread(
            publisher,
            out_tx,
            current_pid,
            stdin_clone,
            ready_ctx.clone(),
            shutdown_ctx,
        );

        Ok(StartedSupervisor {
            agent_id,
            ctx,
            ready_ctx,
            stdin,
            thread_contexts: vec![process_context, health_context],
            join_handles: vec![termination_handle, router_handle],
        })
    }
}

impl SupervisorStopper for StartedSupervisor {
    fn stop(self) -> Result<(), SupervisorError> {
        self.ctx.cancel_all(true).unwrap();

        let mut stop_result = Ok(());
        for thread_context in self.thread_contexts {
            let thread_name = thread_context.thread_name().to_string();
            match thread_context.stop_blocking() {
                Ok(_) => debug!(agent_id = %self.agent_id, "{thread_name} stopped"),
                Err(err) => {
                    error!(agent_id = %self.agent_id, "error stopping '{thread_name}': {err}");
                    if stop_result.is_ok() {
                        stop_result = Err(err.into());
                    }
                }
            }
        }
        for handle in self.join_handles {
            let _ = handle.join();
        }

        stop_result
    }

    fn send_line(&self, line: &str) -> Result<(), CommandError> {
        self.stdin.write_line(line)
    }

    fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready_ctx.wait_timeout(timeout)
    }
}

////////////////////////////////////////////////////////////////////////////////////
// Helpers
////////////////////////////////////////////////////////////////////////////////////

/// Starts the process while holding the pid guard, then releases the guard so
/// the termination listener can take it on graceful shutdown. Waits until the
/// process exits.
fn start_command(
    not_started: AgentCommand<Unstarted>,
    mut pid: MutexGuard<Option<u32>>,
    stdin: &StdinHandle,
    out_tx: Sender<OutputEvent>,
) -> Result<ExitStatus, CommandError> {
    let mut started = not_started.start()?;
    *pid = Some(started.get_pid());
    stdin.replace(started.take_stdin());

    let streaming = started.stream(out_tx)?;
    drop(pid);

    streaming.wait()
}

#[cfg(target_family = "unix")]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // `code()` is None when the process died from a signal; restart handling
    // treats both the same, so fall back to the signal number.
    status.code().or(status.signal()).unwrap_or_default()
}

#[cfg(not(target_family = "unix"))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or_default()
}

/// Blocks on `ctx`; once the termination signal is set, sends a graceful
/// shutdown to the currently running process, if any.
fn wait_for_termination(
    current_pid: Arc<Mutex<Option<u32>>>,
    ctx: Context<bool>,
    shutdown_ctx: Context<bool>,
    stop_grace: Duration,
) -> JoinHandle<()> {
    spawn_named_thread("termination signal listener", move || {
        let (lck, cvar) = ctx.get_lock_cvar();
        drop(cvar.wait_while(lck.lock().unwrap(), |finish| !*finish));

        match *current_pid.lock().unwrap() {
            Some(pid) => {
                info!(pid, "stopping worker process");
                let _ = ProcessTerminator::new(pid)
                    .with_exit_timeout(stop_grace)
                    .shutdown(|grace| wait_exit_timeout(shutdown_ctx, grace));
            }
            None => {
                debug!("stopped supervisor without a running process");
            }
        }
    })
}

/// Routes captured output lines: protocol frames become supervisor events,
/// everything else is log output. Ends when all writers hang up.
fn spawn_output_router(
    agent_id: AgentId,
    out_rx: Receiver<OutputEvent>,
    last_output: Arc<Mutex<Option<Instant>>>,
    ready_ctx: Context<bool>,
    publisher: EventPublisher<SupervisorEvent>,
) -> JoinHandle<()> {
    spawn_named_thread("worker output router", move || {
        for event in out_rx.iter() {
            *last_output.lock().unwrap() = Some(Instant::now());
            match event {
                OutputEvent::Stdout(line) => match WorkerOutput::parse(&line) {
                    WorkerOutput::Frame(WorkerFrame::Ready) => {
                        ready_ctx.cancel_all(true).unwrap();
                        let _ = publisher.publish(SupervisorEvent::Ready(agent_id.clone()));
                    }
                    WorkerOutput::Frame(WorkerFrame::Response { content, reply_to }) => {
                        let _ = publisher.publish(SupervisorEvent::Response {
                            id: agent_id.clone(),
                            content,
                            reply_to,
                        });
                    }
                    WorkerOutput::Frame(WorkerFrame::Heartbeat) => {
                        // the timestamp update above is the whole point
                    }
                    WorkerOutput::Frame(WorkerFrame::Log { level, message }) => {
                        debug!(agent_id = %agent_id, level = level.as_deref().unwrap_or("info"), "{message}");
                    }
                    WorkerOutput::Raw(line) => {
                        debug!(agent_id = %agent_id, "{line}");
                    }
                },
                OutputEvent::Stderr(line) => {
                    debug!(agent_id = %agent_id, stderr = true, "{line}");
                }
            }
        }
    })
}
