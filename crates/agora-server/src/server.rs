//! `AgoraServer`: the Axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agora_relay::RelayHub;
use agora_relay::stats::StatsSnapshot;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::ws::auth::{AllowAll, Authenticator};
use crate::ws::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay core.
    pub hub: Arc<RelayHub>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Token authenticator for new sessions.
    pub authenticator: Arc<dyn Authenticator>,
    /// When the server started.
    pub start_time: Instant,
    /// Renders the `/metrics` endpoint.
    pub metrics: PrometheusHandle,
}

/// The Agora front-end server.
pub struct AgoraServer {
    config: Arc<ServerConfig>,
    hub: Arc<RelayHub>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: PrometheusHandle,
}

impl AgoraServer {
    /// Create a server over an already-started hub.
    pub fn new(config: ServerConfig, hub: Arc<RelayHub>, metrics: PrometheusHandle) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            authenticator: Arc::new(AllowAll),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Replace the default open-door authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            config: self.config.clone(),
            authenticator: self.authenticator.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve. Returns the bound address and the serve task, which
    /// exits when the shutdown token fires.
    pub async fn listen(&self) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "server exited with error");
            }
        });
        Ok((addr, handle))
    }

    /// The relay core.
    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.hub.stats_snapshot().await;
    let phase = state.hub.migration().phase();
    Json(health::health_check(state.start_time, &snapshot, phase))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.hub.stats_snapshot().await)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

/// GET /ws: upgrade to a relay session.
///
/// Refused with 503 while draining or at the connection cap, before the
/// upgrade is accepted.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.hub.migration().accepting_connections() {
        metrics::counter!(crate::metrics::WS_REFUSED_TOTAL, "reason" => "draining").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    if state.hub.registry().count().await >= state.config.max_connections {
        metrics::counter!(crate::metrics::WS_REFUSED_TOTAL, "reason" => "capacity").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "at capacity").into_response();
    }
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state))
}
