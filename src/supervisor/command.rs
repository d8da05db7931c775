use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::agent::definition::WorkerCommand;
use crate::utils::threads::spawn_named_thread;

use super::error::CommandError;
use super::stream::OutputEvent;

pub struct Unstarted;
pub struct Started;

/// A worker command in typestate form: built, then started, then streamed.
/// stdin/stdout/stderr are always piped; the stdin end is handed out through
/// a [`StdinHandle`] so the control plane can keep writing frames while the
/// supervisor owns the [`Child`].
pub struct AgentCommand<State = Unstarted> {
    cmd: Option<Command>,
    child: Option<Child>,
    pid: u32,

    state: PhantomData<State>,
}

impl AgentCommand {
    pub fn new(worker: &WorkerCommand) -> Self {
        let mut command = Command::new(&worker.bin);
        command
            .args(&worker.args)
            .envs(&worker.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Self {
            cmd: Some(command),
            child: None,
            pid: 0,
            state: PhantomData,
        }
    }
}

impl AgentCommand<Unstarted> {
    pub fn start(self) -> Result<AgentCommand<Started>, CommandError> {
        let child = self
            .cmd
            .ok_or(CommandError::CommandConsumed)?
            .spawn()?;
        let pid = child.id();

        Ok(AgentCommand {
            cmd: None,
            child: Some(child),
            pid,
            state: PhantomData,
        })
    }
}

impl AgentCommand<Started> {
    pub fn get_pid(&self) -> u32 {
        self.pid
    }

    /// Moves the child's stdin pipe out, to be shared through a [`StdinHandle`].
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    /// Spawns one named reader thread per output pipe; every line is forwarded
    /// to `snd` until the pipe closes.
    pub fn stream(mut self, snd: Sender<OutputEvent>) -> Result<Self, CommandError> {
        let child = self.child.as_mut().ok_or(CommandError::ProcessNotStarted)?;

        let stdout = child
            .stdout
            .take()
            .ok_or(CommandError::ProcessNotStarted)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(CommandError::ProcessNotStarted)?;

        let stdout_snd = snd.clone();
        spawn_named_thread(format!("stdout reader {}", self.pid), move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if stdout_snd.send(OutputEvent::Stdout(line)).is_err() {
                    break;
                }
            }
        });
        spawn_named_thread(format!("stderr reader {}", self.pid), move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                if snd.send(OutputEvent::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        Ok(self)
    }

    /// Waits until the process exits.
    pub fn wait(self) -> Result<ExitStatus, CommandError> {
        Ok(self
            .child
            .ok_or(CommandError::ProcessNotStarted)?
            .wait()?)
    }
}

/// Clonable handle to a worker's stdin pipe. The supervisor replaces the pipe
/// on restart, so holders keep a valid handle across worker generations.
#[derive(Clone, Default)]
pub struct StdinHandle(Arc<Mutex<Option<ChildStdin>>>);

impl StdinHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn replace(&self, stdin: Option<ChildStdin>) {
        *self.0.lock().unwrap() = stdin;
    }

    /// Writes one newline-terminated frame. The line must already carry its
    /// trailing newline.
    pub fn write_line(&self, line: &str) -> Result<(), CommandError> {
        let mut guard = self.0.lock().unwrap();
        let stdin = guard.as_mut().ok_or(CommandError::StdinClosed)?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }
}
