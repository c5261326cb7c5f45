//! Transport manager: one lifecycle over stdio, HTTP (with SSE), and
//! WebSocket endpoints. Ports are pre-allocated before anything serves, and
//! a failed bind rolls back whatever was already bound.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod ws;

pub use stdio::{handle_tool_call, ToolCall, ToolResult};

use crate::agents::{AgentRegistry, TaskQueues};
use crate::config::LoomConfig;
use crate::jobs::JobRegistry;
use crate::models::TransportKind;
use crate::monitoring::SystemMonitor;
use crate::notifications::NotificationBus;
use crate::orchestrator::DeliveryRouter;
use crate::rate_limit::RateLimiters;
use crate::response::ResponseProcessor;
use crate::security::{AuthService, SecurityGateway};
use crate::{LoomError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Everything a transport handler can reach; cheap to clone.
#[derive(Clone)]
pub struct TransportState {
    pub config: Arc<LoomConfig>,
    pub registry: Arc<AgentRegistry>,
    pub queues: Arc<TaskQueues>,
    pub jobs: Arc<JobRegistry>,
    pub bus: Arc<NotificationBus>,
    pub auth: Arc<AuthService>,
    pub security: Arc<SecurityGateway>,
    pub processor: Arc<ResponseProcessor>,
    pub delivery: Arc<DeliveryRouter>,
    pub monitor: Arc<SystemMonitor>,
    pub rate_limits: Arc<RateLimiters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportHealth {
    pub transport: TransportKind,
    pub enabled: bool,
    pub running: bool,
    pub port: Option<u16>,
    pub connections: usize,
}

#[derive(Default)]
struct BoundPorts {
    http: Option<u16>,
    websocket: Option<u16>,
}

pub struct TransportManager {
    state: TransportState,
    running: AtomicBool,
    bound: Mutex<BoundPorts>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportManager {
    pub fn new(state: TransportState) -> Self {
        Self {
            state,
            running: AtomicBool::new(false),
            bound: Mutex::new(BoundPorts::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Bind every enabled transport, then serve.
    ///
    /// Fail-fast: the bind phase completes for all transports before any of
    /// them starts serving; the first failure drops the listeners already
    /// bound and leaves the manager stopped. Idempotent once running.
    pub async fn start_all(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = &self.state.config.transport;
        let host = config.http.host.clone();

        // Pre-allocation phase.
        let bind_result: Result<(Option<TcpListener>, Option<TcpListener>)> = async {
            let http_listener = if config.http.enabled {
                Some(bind(&host, config.http.port).await?)
            } else {
                None
            };
            let ws_listener = if config.websocket.enabled {
                Some(bind(&host, config.websocket.port).await?)
            } else {
                None
            };
            Ok((http_listener, ws_listener))
        }
        .await;

        let (http_listener, ws_listener) = match bind_result {
            Ok(listeners) => listeners,
            Err(e) => {
                // Listeners already bound are dropped here, releasing their ports.
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        {
            let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
            bound.http = http_listener
                .as_ref()
                .and_then(|l| l.local_addr().ok())
                .map(|a| a.port());
            bound.websocket = ws_listener
                .as_ref()
                .and_then(|l| l.local_addr().ok())
                .map(|a| a.port());
        }

        // Serve phase.
        let mut handles = Vec::new();
        if let Some(listener) = http_listener {
            let router = http::build_router(self.state.clone());
            let mut stop = shutdown.clone();
            info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(0), "http transport ready");
            handles.push(tokio::spawn(async move {
                let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                });
                if let Err(e) = serve.await {
                    error!("http transport failed: {e}");
                }
            }));
        }
        if let Some(listener) = ws_listener {
            let router = ws::build_router(self.state.clone());
            let mut stop = shutdown.clone();
            info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(0), "websocket transport ready");
            handles.push(tokio::spawn(async move {
                let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                });
                if let Err(e) = serve.await {
                    error!("websocket transport failed: {e}");
                }
            }));
        }
        if config.stdio.enabled {
            let state = self.state.clone();
            let stop = shutdown.clone();
            handles.push(tokio::spawn(stdio::run_stdio(state, stop)));
        }

        *self.handles.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        info!("all enabled transports started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_status(&self) -> Vec<TransportHealth> {
        let config = &self.state.config.transport;
        let running = self.is_running();
        let bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());

        vec![
            TransportHealth {
                transport: TransportKind::Http,
                enabled: config.http.enabled,
                running: running && bound.http.is_some(),
                port: bound.http.or(config.http.enabled.then_some(config.http.port)),
                connections: self.state.bus.session_count(),
            },
            TransportHealth {
                transport: TransportKind::Websocket,
                enabled: config.websocket.enabled,
                running: running && bound.websocket.is_some(),
                port: bound
                    .websocket
                    .or(config.websocket.enabled.then_some(config.websocket.port)),
                connections: self.state.delivery.ws_connection_count(),
            },
            TransportHealth {
                transport: TransportKind::Sse,
                enabled: config.sse.enabled,
                running: running && config.sse.enabled && bound.http.is_some(),
                port: bound.http,
                connections: self.state.bus.session_count(),
            },
            TransportHealth {
                transport: TransportKind::Stdio,
                enabled: config.stdio.enabled,
                running: running && config.stdio.enabled,
                port: None,
                connections: 0,
            },
        ]
    }
}

/// Bind one listener; `EADDRINUSE` is tagged so upstream retries know the
/// cause.
async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port)).await.map_err(|e| {
        let tag = (e.kind() == std::io::ErrorKind::AddrInUse).then_some("port_allocation");
        LoomError::Transport {
            message: format!("binding {host}:{port}: {e}"),
            tag,
        }
    })
}
