use thiserror::Error;

use crate::agent::definition::AgentId;
use crate::registry::error::StoreError;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// The queue is at capacity; the message was not enqueued and nothing
    /// was dropped.
    #[error("message queue is full ({0} messages)")]
    QueueFull(usize),

    #[error("message from `{0}` is addressed to itself")]
    SelfAddressed(AgentId),

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("storage error: `{0}`")]
    Store(#[from] StoreError),
}
