use std::time::Duration;

use thiserror::Error;

use crate::utils::thread_context::ThreadContextStopperError;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command was already consumed")]
    CommandConsumed,
    #[error("process not started")]
    ProcessNotStarted,
    #[error("worker stdin is closed")]
    StdinClosed,
    #[error("i/o error: `{0}`")]
    IoError(#[from] std::io::Error),
    #[cfg(target_family = "unix")]
    #[error("signal error: `{0}`")]
    SignalError(#[from] nix::errno::Errno),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("error spawning worker process: `{0}`")]
    SpawnFailed(#[from] CommandError),
    #[error("worker did not report ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("error stopping supervisor thread: `{0}`")]
    ThreadStop(#[from] ThreadContextStopperError),
}
