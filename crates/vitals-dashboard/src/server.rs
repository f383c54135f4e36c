//! HTTP server implementation using axum.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use vitals_telemetry::Metrics;

use crate::config::DashboardConfig;
use crate::error::{DashboardError, DashboardResult};
use crate::state::DashboardState;
use crate::types::{DashboardMessage, StatusSnapshot, WindowSnapshot};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Caps concurrent WebSocket clients.
pub struct ConnectionLimiter {
    current: AtomicUsize,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve a slot. The slot is released when the guard drops, so the
    /// guard can travel into the upgraded socket task.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current >= self.max {
                return None;
            }
            if self
                .current
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                Metrics::dashboard_client_connected();
                return Some(ConnectionGuard {
                    limiter: Arc::clone(self),
                });
            }
        }
    }

    pub fn current_count(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

pub struct ConnectionGuard {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limiter.current.fetch_sub(1, Ordering::Release);
        Metrics::dashboard_client_disconnected();
    }
}

/// Shared application state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    dashboard_state: DashboardState,
    broadcast_tx: broadcast::Sender<String>,
    connection_limiter: Arc<ConnectionLimiter>,
    max_connections: usize,
}

impl AppState {
    pub fn new(
        dashboard_state: DashboardState,
        broadcast_tx: broadcast::Sender<String>,
        config: &DashboardConfig,
    ) -> Self {
        Self {
            dashboard_state,
            broadcast_tx,
            connection_limiter: Arc::new(ConnectionLimiter::new(config.max_connections)),
            max_connections: config.max_connections,
        }
    }
}

/// Create the axum router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/api/status", get(get_status))
        .route("/api/windows/{*topic}", get(get_window))
        .route("/metrics", get(get_metrics))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn serve_index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.dashboard_state.collect_status())
}

async fn get_window(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Json<WindowSnapshot>, (StatusCode, String)> {
    state
        .dashboard_state
        .window(&topic)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No window for topic {topic}")))
}

async fn get_metrics() -> Response {
    match Metrics::gather_text() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(guard) = state.connection_limiter.try_acquire() else {
        warn!(
            current = state.connection_limiter.current_count(),
            max = state.max_connections,
            "WebSocket connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    info!(
        connections = state.connection_limiter.current_count(),
        "New WebSocket connection"
    );
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, guard))
}

/// Handle a WebSocket connection.
async fn handle_ws_connection(socket: WebSocket, state: AppState, _guard: ConnectionGuard) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the initial snapshot so no update is missed in between
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    let initial = DashboardMessage::Snapshot(state.dashboard_state.collect_snapshot());
    if let Ok(json) = serde_json::to_string(&initial) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            debug!("Failed to send initial snapshot, client disconnected");
            return;
        }
    }

    // Pings are answered by axum; this only watches for the client leaving
    let mut incoming_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    debug!("Client sent close frame");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "WebSocket receive error");
                    break;
                }
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            result = broadcast_rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            debug!("Failed to send message, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "WebSocket client lagged, catching up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }
            _ = &mut incoming_task => {
                debug!("Incoming task completed, closing connection");
                break;
            }
        }
    }
    incoming_task.abort();

    info!(
        connections = state.connection_limiter.current_count().saturating_sub(1),
        "WebSocket connection closed"
    );
}

/// Run the dashboard HTTP server until `shutdown` fires.
pub async fn run_server(
    dashboard_state: DashboardState,
    config: DashboardConfig,
    shutdown: CancellationToken,
) -> DashboardResult<()> {
    // update_interval_ms = 500ms -> 2 updates/sec; 32 messages buffer slow clients
    let (broadcast_tx, _) = broadcast::channel::<String>(32);

    let state = AppState::new(dashboard_state.clone(), broadcast_tx.clone(), &config);
    let app = create_router(state);

    tokio::spawn(crate::broadcast::run_broadcaster(
        dashboard_state,
        broadcast_tx,
        config.update_interval_ms,
        shutdown.clone(),
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| DashboardError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(addr = %addr, "Starting dashboard server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Dashboard server stopped");
    Ok(())
}
