use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use relay_core::source::EventSourceFactory;
use relay_telemetry::MetricsRecorder;

use crate::config::ServerConfig;
use crate::connection;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Builds a fresh event source for every accepted connection.
    pub factory: Arc<dyn EventSourceFactory>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<MetricsRecorder>,
    /// Parent of every connection token.
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn EventSourceFactory>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            registry: Arc::new(ConnectionRegistry::new()),
            metrics,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle that keeps the server running.
pub async fn start(
    config: ServerConfig,
    factory: Arc<dyn EventSourceFactory>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = config.bind_addr();
    let state = AppState::new(config, factory, metrics);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        max_send_queue = state.config.max_send_queue,
        verbosity = ?state.config.verbosity,
        "relay server started"
    );

    let router = build_router(state.clone());
    let shutdown = state.shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        state,
        server,
    })
}

/// Handle returned by `start()`; keeps the accept loop alive.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.state.registry.count()
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.state.metrics)
    }

    /// Close every connection and stop accepting new ones.
    pub async fn shutdown(self) {
        tracing::info!(connections = self.connection_count(), "shutting down");
        self.state.shutdown.cancel();
        let _ = self.server.await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let info = state.registry.register();
    connection::handle_ws_connection(socket, info, state).await;
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        &state.registry,
        &state.metrics,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_engine::{ScriptedFactory, ScriptedTurn};

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    fn factory() -> Arc<dyn EventSourceFactory> {
        Arc::new(ScriptedFactory::new(vec![ScriptedTurn::text(&["hi"])]))
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let handle = start(test_config(), factory(), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap();
        assert_ne!(handle.port(), 0);
        assert_eq!(handle.connection_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_is_an_error() {
        let first = start(test_config(), factory(), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap();
        let taken = ServerConfig {
            port: first.port(),
            ..test_config()
        };
        assert!(start(taken, factory(), Arc::new(MetricsRecorder::new()))
            .await
            .is_err());
        first.shutdown().await;
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let handle = start(test_config(), factory(), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap();
        let url = format!("http://{}/health", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["clients"], serde_json::json!([]));
        assert!(body["metrics"]["counters"].is_object());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let handle = start(test_config(), factory(), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap();
        let url = format!("http://{}/nonexistent", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        handle.shutdown().await;
    }
}
