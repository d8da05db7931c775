use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::control_plane::control_plane::ControlPlane;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::event::EventBus;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use crate::utils::threads::spawn_named_thread;

use super::config::ServerConfig;
use super::error::ServerError;
use super::frames::WsFrame;
use super::routes::{build_router, AppState};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const BRIDGE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const WS_BROADCAST_CAPACITY: usize = 256;

/// Holds what is needed to start the HTTP/WebSocket server and is
/// responsible for starting it on its own OS thread with its own runtime.
pub struct Runner {
    config: ServerConfig,
    control_plane: Arc<ControlPlane>,
}

/// Owns the server thread; stops the server on drop.
pub struct StartedHttpServer {
    thread_context: Option<StartedThreadContext>,
    bridge_stop: Arc<AtomicBool>,
    bridge_handle: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(config: ServerConfig, control_plane: Arc<ControlPlane>) -> Self {
        Self {
            config,
            control_plane,
        }
    }

    /// Starts the server thread and waits for the bind result.
    pub fn start(self) -> Result<StartedHttpServer, ServerError> {
        let (startup_publisher, startup_consumer) = std::sync::mpsc::channel();

        let (ws_broadcast, _) = tokio::sync::broadcast::channel(WS_BROADCAST_CAPACITY);
        let bridge_stop = Arc::new(AtomicBool::new(false));
        let bridge_handle = run_event_bridge(
            self.control_plane.events(),
            ws_broadcast.clone(),
            bridge_stop.clone(),
        );

        let thread_context = NotStartedThreadContext::new("http server", {
            move |stop_consumer| self.serve(stop_consumer, startup_publisher, ws_broadcast)
        })
        .start();

        let startup_result = startup_consumer
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|err| match err {
                std::sync::mpsc::RecvTimeoutError::Timeout => {
                    ServerError::StartupTimeout(STARTUP_TIMEOUT)
                }
                std::sync::mpsc::RecvTimeoutError::Disconnected => {
                    ServerError::StartupChannelClosed
                }
            })?;
        startup_result.map_err(ServerError::BindError)?;

        Ok(StartedHttpServer {
            thread_context: Some(thread_context),
            bridge_stop,
            bridge_handle: Some(bridge_handle),
        })
    }

    fn serve(
        self,
        stop_consumer: EventConsumer<CancellationMessage>,
        startup_publisher: std::sync::mpsc::Sender<Result<(), String>>,
        ws_broadcast: tokio::sync::broadcast::Sender<WsFrame>,
    ) {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = startup_publisher.send(Err(err.to_string()));
                return;
            }
        };

        runtime.block_on(async move {
            let address = format!("{}:{}", self.config.host, self.config.port);
            info!("starting HTTP server at http://{address}");

            let listener = match tokio::net::TcpListener::bind(&address).await {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = startup_publisher.send(Err(err.to_string()));
                    return;
                }
            };

            let state = AppState {
                control_plane: self.control_plane,
                ws_broadcast,
                server_config: self.config.clone(),
            };
            let app = build_router(state);

            let _ = startup_publisher.send(Ok(()));

            let shutdown = async move {
                // resolves when the thread context publishes its stop signal
                let _ = tokio::task::spawn_blocking(move || {
                    let _ = stop_consumer.as_ref().recv();
                })
                .await;
            };

            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("HTTP server error: {err}");
            }
            debug!("HTTP server loop finished");
        });
    }
}

impl Drop for StartedHttpServer {
    fn drop(&mut self) {
        info!("waiting for the API server to stop gracefully...");

        if let Some(thread_context) = self.thread_context.take() {
            let _ = thread_context
                .stop()
                .inspect(|_| debug!("server thread stopped"))
                .inspect_err(|err| error!("error stopping the API server: {err}"));
        }

        self.bridge_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.bridge_handle.take() {
            let _ = handle.join();
        }
    }
}

/// OS thread bridging the sync event bus into the async observer broadcast.
/// When the bus drops the bridge for lagging, it resubscribes, as any other
/// observer would.
fn run_event_bridge(
    bus: EventBus,
    ws_broadcast: tokio::sync::broadcast::Sender<WsFrame>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    spawn_named_thread("observer event bridge", move || {
        while !stop.load(Ordering::Relaxed) {
            let (subscriber_id, events) = bus.subscribe();

            loop {
                if stop.load(Ordering::Relaxed) {
                    bus.unsubscribe(subscriber_id);
                    return;
                }
                match events.recv_timeout(BRIDGE_POLL_INTERVAL) {
                    Ok(event) => {
                        if let Some(frame) = WsFrame::from_event(&event) {
                            // no receivers just means no connected observers
                            let _ = ws_broadcast.send(frame);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("observer bridge was dropped by the event bus, resubscribing");
                        break;
                    }
                }
            }
        }
    })
}
