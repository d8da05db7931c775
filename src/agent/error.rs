use std::time::Duration;

use thiserror::Error;

use crate::registry::error::StoreError;
use crate::supervisor::error::SupervisorError;

use super::definition::AgentSpecError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid agent spec: {0}")]
    InvalidSpec(#[from] AgentSpecError),

    #[error("agent `{0}` already exists")]
    DuplicateId(String),

    #[error("agent `{0}` not found")]
    AgentNotFound(String),

    #[error("agent `{0}` is still running")]
    StillRunning(String),

    #[error("worker for `{0}` did not report ready within {1:?}")]
    StartupTimeout(String, Duration),

    #[error("supervisor error: `{0}`")]
    Supervisor(#[from] SupervisorError),

    #[error("storage error: `{0}`")]
    Store(#[from] StoreError),
}
