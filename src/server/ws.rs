use std::collections::HashSet;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use ulid::Ulid;

use super::frames::WsFrame;
use super::routes::AppState;

pub const SERVER_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        filters: Vec<String>,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

/// One connected observer: handshake, initial snapshots, then filtered event
/// forwarding until the client disconnects, idles out or lags.
async fn client_loop(mut socket: WebSocket, state: AppState) {
    let client_id = Ulid::new().to_string();
    debug!(client_id, "observer connected");

    let hello = WsFrame::new(
        "connection_established",
        json!({
            "clientId": client_id,
            "serverTime": chrono::Utc::now(),
            // reconnection contract for observers that get dropped
            "reconnect": {
                "backoff": "exponential",
                "maxDelayMs": 30_000,
                "maxAttempts": 10,
            },
        }),
    );
    let agents = WsFrame::new(
        "agent_status_list",
        serde_json::to_value(state.control_plane.list_agents(None)).unwrap_or_default(),
    );
    let dashboard = WsFrame::new(
        "task_dashboard",
        serde_json::to_value(state.control_plane.task_dashboard()).unwrap_or_default(),
    );
    for frame in [hello, agents, dashboard] {
        if send_frame(&mut socket, &frame).await.is_err() {
            return;
        }
    }

    let mut events = state.ws_broadcast.subscribe();
    let mut filters: Option<HashSet<String>> = None;
    let mut last_activity = Instant::now();
    let mut ping = tokio::time::interval(SERVER_PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                let pong = WsFrame::new("pong", json!({}));
                                if send_frame(&mut socket, &pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Subscribe { filters: wanted }) => {
                                filters = Some(wanted.into_iter().collect());
                            }
                            Err(err) => {
                                debug!(client_id, "ignoring malformed client message: {err}");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(client_id, "observer socket error: {err}");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(frame) => {
                        let wanted = filters
                            .as_ref()
                            .map_or(true, |set| set.contains(&frame.frame_type));
                        if wanted && send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "observer lagged, dropping it");
                        let error = WsFrame::new(
                            "error",
                            json!({ "error": "subscriber_lagged", "skipped": skipped }),
                        );
                        let _ = send_frame(&mut socket, &error).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > CLIENT_IDLE_TIMEOUT {
                    debug!(client_id, "observer idle, terminating");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(client_id, "observer disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload)).await
}
