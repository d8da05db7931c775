use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::definition::{Agent, AgentId, AgentPatch, AgentSpec, AgentStatus};
use crate::control_plane::config::ControlPlaneConfig;
use crate::control_plane::control_plane::ControlPlane;
use crate::metrics::series::Interval;
use crate::task::manager::TaskFilter;
use crate::task::task::{Task, TaskId, TaskPatch, TaskSpec, TaskStatus};

use super::config::ServerConfig;
use super::error::ApiError;
use super::frames::WsFrame;
use super::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub control_plane: Arc<ControlPlane>,
    pub ws_broadcast: tokio::sync::broadcast::Sender<WsFrame>,
    pub server_config: ServerConfig,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/websocket-info", get(websocket_info))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route(
            "/api/agents/:id",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/api/agents/:id/start", post(start_agent))
        .route("/api/agents/:id/stop", post(stop_agent))
        .route("/api/agents/:id/restart", post(restart_agent))
        .route("/api/agents/:id/tasks", get(agent_tasks))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/dashboard", get(task_dashboard))
        .route(
            "/api/tasks/:id",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/api/metrics/system", get(system_metrics))
        .route("/api/metrics/agents/:id", get(agent_metrics))
        .route("/api/system/config", get(get_config).put(put_config))
        .route("/api/system/status", get(system_status))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn agent_id(raw: &str) -> Result<AgentId, ApiError> {
    AgentId::new(raw).map_err(|err| ApiError::bad_request(err.to_string()))
}

fn task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("`{raw}` is not a task id")))
}

////////////////////////////////////////////////////////////////////////////////////
// System
////////////////////////////////////////////////////////////////////////////////////

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.control_plane.health()))
}

async fn websocket_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "url": format!(
            "ws://{}:{}/ws",
            state.server_config.host, state.server_config.port
        ),
    }))
}

async fn system_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.control_plane.system_status()))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(config_summary(state.control_plane.config()))
}

/// Validates the submitted configuration and persists it next to the
/// registry; it takes effect at the next restart.
async fn put_config(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    serde_json::from_value::<ControlPlaneConfig>(body.clone())
        .map_err(|err| ApiError::bad_request(format!("invalid config: {err}")))?;

    let yaml = serde_yaml::to_string(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid config: {err}")))?;
    let path = state.control_plane.config().working_dir.join("config.yaml");
    tokio::fs::write(&path, yaml).await.map_err(|err| {
        ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            err.to_string(),
        )
    })?;

    Ok(Json(json!({
        "status": "accepted",
        "path": path,
        "note": "applies at the next restart",
    })))
}

fn config_summary(config: &ControlPlaneConfig) -> Value {
    json!({
        "workingDir": config.working_dir,
        "server": {
            "host": config.server.host.to_string(),
            "port": u16::from(config.server.port.clone()),
            "enabled": config.server.enabled,
        },
        "supervisor": {
            "checkIntervalMs": config.supervisor.check_interval.as_millis() as u64,
            "unresponsiveTimeoutMs": config.supervisor.unresponsive_timeout.as_millis() as u64,
            "startupTimeoutMs": config.supervisor.startup_timeout.as_millis() as u64,
            "stopTimeoutMs": config.supervisor.stop_timeout.as_millis() as u64,
        },
        "broker": {
            "queueCapacity": config.broker.queue_capacity,
            "workers": config.broker.workers,
            "historyCapacity": config.broker.history_capacity,
        },
        "approvals": {
            "sweepIntervalMs": config.approvals.sweep_interval.as_millis() as u64,
        },
        "metrics": {
            "sampleIntervalMs": config.metrics.sample_interval.as_millis() as u64,
            "retention": config.metrics.retention,
        },
        "shutdownTimeoutMs": config.shutdown_timeout.as_millis() as u64,
    })
}

////////////////////////////////////////////////////////////////////////////////////
// Agents
////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct AgentListQuery {
    status: Option<AgentStatus>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentListQuery>,
) -> Json<Vec<Agent>> {
    Json(state.control_plane.list_agents(query.status))
}

async fn create_agent(
    State(state): State<AppState>,
    Json(spec): Json<AgentSpec>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.control_plane.create_agent(spec)?))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    let id = agent_id(&id)?;
    Ok(Json(state.control_plane.get_agent(&id)?))
}

async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<AgentPatch>,
) -> Result<Json<Agent>, ApiError> {
    let id = agent_id(&id)?;
    Ok(Json(state.control_plane.update_agent(&id, patch)?))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = agent_id(&id)?;
    blocking(state.control_plane.clone(), move |control_plane| {
        control_plane.delete_agent(&id)
    })
    .await?;
    Ok(Json(json!({ "status": "deleted" })))
}

async fn start_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = agent_id(&id)?;
    let status = blocking(state.control_plane.clone(), move |control_plane| {
        control_plane.start_agent(&id)
    })
    .await?;
    Ok(Json(json!({ "status": status })))
}

async fn stop_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = agent_id(&id)?;
    let status = blocking(state.control_plane.clone(), move |control_plane| {
        control_plane.stop_agent(&id)
    })
    .await?;
    Ok(Json(json!({ "status": status })))
}

async fn restart_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = agent_id(&id)?;
    let status = blocking(state.control_plane.clone(), move |control_plane| {
        control_plane.restart_agent(&id)
    })
    .await?;
    Ok(Json(json!({ "status": status })))
}

async fn agent_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let id = agent_id(&id)?;
    // a 404 for unknown agents, not an empty list
    state.control_plane.get_agent(&id)?;
    Ok(Json(state.control_plane.agent_tasks(&id)))
}

////////////////////////////////////////////////////////////////////////////////////
// Tasks
////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskListQuery {
    agent_id: Option<String>,
    status: Option<TaskStatus>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let filter = TaskFilter {
        agent_id: query.agent_id.as_deref().map(agent_id).transpose()?,
        status: query.status,
    };
    Ok(Json(state.control_plane.list_tasks(&filter)))
}

async fn create_task(
    State(state): State<AppState>,
    Json(spec): Json<TaskSpec>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.control_plane.create_task(spec)?))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = task_id(&id)?;
    Ok(Json(state.control_plane.get_task(&id)?))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Task>, ApiError> {
    let id = task_id(&id)?;
    Ok(Json(state.control_plane.update_task(&id, patch)?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = task_id(&id)?;
    state.control_plane.delete_task(&id)?;
    Ok(Json(json!({ "status": "deleted" })))
}

async fn task_dashboard(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.control_plane.task_dashboard()))
}

////////////////////////////////////////////////////////////////////////////////////
// Metrics
////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsQuery {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    interval: Option<Interval>,
}

impl MetricsQuery {
    fn resolve(&self) -> (DateTime<Utc>, DateTime<Utc>, Interval) {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let start = self.start_time.unwrap_or(end - Duration::hours(1));
        (start, end, self.interval.unwrap_or(Interval::Minute))
    }
}

async fn system_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Json<Value> {
    let (start, end, interval) = query.resolve();
    let buckets = state.control_plane.metrics_series().query(start, end, interval);
    Json(json!({ "buckets": buckets }))
}

async fn agent_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Value>, ApiError> {
    let id = agent_id(&id)?;
    state.control_plane.get_agent(&id)?;

    let (start, end, interval) = query.resolve();
    let samples = state
        .control_plane
        .agent_metrics_series(&id, start, end, interval);
    Ok(Json(json!({ "agentId": id.get(), "samples": samples })))
}

////////////////////////////////////////////////////////////////////////////////////
// Helpers
////////////////////////////////////////////////////////////////////////////////////

/// Runs a potentially long facade call off the async workers.
async fn blocking<T, F>(control_plane: Arc<ControlPlane>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(Arc<ControlPlane>) -> Result<T, crate::control_plane::error::ControlPlaneError>
        + Send
        + 'static,
{
    tokio::task::spawn_blocking(move || f(control_plane))
        .await
        .map_err(|err| {
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                err.to_string(),
            )
        })?
        .map_err(ApiError::from)
}
