use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::agent::error::AgentError;
use crate::broker::error::BrokerError;
use crate::control_plane::error::ControlPlaneError;
use crate::task::error::TaskError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("could not bind the listener: `{0}`")]
    BindError(String),

    #[error("server did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("server startup channel closed")]
    StartupChannelClosed,
}

/// JSON error body: `{error, message, code}` with the HTTP status mapped
/// from the error kind.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
    message: String,
    code: u16,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            code: status.as_u16(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        let message = err.to_string();
        let (status, kind) = match &err {
            ControlPlaneError::Agent(agent) => match agent {
                AgentError::InvalidSpec(_) => (StatusCode::BAD_REQUEST, "invalid"),
                AgentError::AgentNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                AgentError::DuplicateId(_) | AgentError::StillRunning(_) => {
                    (StatusCode::CONFLICT, "conflict")
                }
                AgentError::StartupTimeout(_, _) => (StatusCode::INTERNAL_SERVER_ERROR, "timeout"),
                AgentError::Supervisor(_) | AgentError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
            ControlPlaneError::Task(task) => match task {
                TaskError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                TaskError::InvalidSpec(_) | TaskError::CycleDetected(_) => {
                    (StatusCode::BAD_REQUEST, "invalid")
                }
                TaskError::IllegalTransition { .. } => (StatusCode::CONFLICT, "conflict"),
                TaskError::Delegation(_) => (StatusCode::SERVICE_UNAVAILABLE, "capacity"),
                TaskError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ControlPlaneError::Broker(broker) => match broker {
                BrokerError::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "capacity"),
                BrokerError::SelfAddressed(_) => (StatusCode::BAD_REQUEST, "invalid"),
                BrokerError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                BrokerError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ControlPlaneError::Approval(approval) => match approval {
                crate::approval::error::ApprovalError::ApprovalNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found")
                }
                crate::approval::error::ApprovalError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
            ControlPlaneError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ControlPlaneError::Store(_)
            | ControlPlaneError::Config(_)
            | ControlPlaneError::Server(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        ApiError::new(status, kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_the_documented_statuses() {
        let cases: Vec<(ControlPlaneError, StatusCode)> = vec![
            (
                AgentError::AgentNotFound("x".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                AgentError::DuplicateId("x".into()).into(),
                StatusCode::CONFLICT,
            ),
            (
                AgentError::StillRunning("x".into()).into(),
                StatusCode::CONFLICT,
            ),
            (
                TaskError::CycleDetected("x".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                BrokerError::QueueFull(10).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ControlPlaneError::ShuttingDown,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}
