use thiserror::Error;

use crate::agent::error::AgentError;
use crate::approval::error::ApprovalError;
use crate::broker::error::BrokerError;
use crate::registry::error::StoreError;
use crate::task::error::TaskError;

use super::config::ConfigError;

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server error: `{0}`")]
    Server(#[from] crate::server::error::ServerError),

    /// New requests are rejected while draining.
    #[error("control plane is shutting down")]
    ShuttingDown,
}
