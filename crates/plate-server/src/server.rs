use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use plate_core::ConnectionId;
use plate_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::{OriginPolicy, ServerConfig};
use crate::engine::{self, EngineHandle, RelayEngine};
use crate::error::ServerError;
use crate::registry::RoomRegistry;
use crate::session::{self, ConnectionConfig};

pub const ROOT_BANNER: &str = "Remote-plate signaling server running";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub metrics: Arc<MetricsRecorder>,
    pub origins: Arc<OriginPolicy>,
    pub connection: ConnectionConfig,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = state.origins.cors_layer();
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/code", get(code_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Create and start the relay. Returns a handle to shut it down.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    config.validate()?;
    let origins = config.origin_policy()?;

    let metrics = Arc::new(MetricsRecorder::new());
    let relay = RelayEngine::new(RoomRegistry::new(), Arc::clone(&metrics));
    let (engine_handle, engine_task) = relay.spawn(config.engine_queue);

    let shutdown = CancellationToken::new();
    let state = AppState {
        engine: engine_handle,
        metrics,
        origins: Arc::new(origins),
        connection: config.connection(),
        shutdown: shutdown.clone(),
    };

    let router = build_router(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Relay server started");

    let token = shutdown.clone();
    let server_task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Relay server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        server: server_task,
        _engine: engine_task,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    _engine: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, close live connections and wait for the listener.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        tracing::info!("Relay server shut down");
    }
}

/// Liveness probe.
async fn root_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        ROOT_BANNER,
    )
}

/// Relay counters as JSON.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snap = state.metrics.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "connections": snap.gauge(engine::METRIC_CONNECTIONS),
        "rooms": snap.gauge(engine::METRIC_ROOMS),
        "joins": snap.counter(engine::METRIC_JOINS),
        "relayed": snap.counter(engine::METRIC_RELAYED),
        "dropped": snap.counter(engine::METRIC_DROPPED),
        "ignored": snap.counter(engine::METRIC_IGNORED),
        "uptime_secs": snap.uptime_secs,
    }))
}

/// Hand out a code no live room is using.
async fn code_handler(State(state): State<AppState>) -> Response {
    match state.engine.fresh_code().await {
        Some(code) => Json(serde_json::json!({ "code": code })).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "relay engine unavailable").into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers.get(header::ORIGIN);
    if !state.origins.permits(origin) {
        tracing::warn!(origin = ?origin, "Rejected WebSocket upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = ConnectionId::new();
    let span = tracing::info_span!("conn", conn_id = %id);
    session::run_connection(socket, id, state.engine, state.connection, state.shutdown)
        .instrument(span)
        .await;
}
