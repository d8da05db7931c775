use thiserror::Error;

use crate::broker::error::BrokerError;
use crate::registry::error::StoreError;

use super::task::TaskStatus;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task `{0}` not found")]
    TaskNotFound(String),

    #[error("invalid task spec: {0}")]
    InvalidSpec(String),

    #[error("illegal transition from `{from}` to `{to}`")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("dependency cycle detected involving task `{0}`")]
    CycleDetected(String),

    /// Delegation is atomic with its `task_request` message: when the
    /// message cannot be enqueued the task is not created.
    #[error("could not enqueue delegation message: `{0}`")]
    Delegation(#[from] BrokerError),

    #[error("storage error: `{0}`")]
    Store(#[from] StoreError),
}
