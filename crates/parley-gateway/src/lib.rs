//! Parley gateway: session store, signaling and chat relay behind one
//! WebSocket endpoint.

pub mod config;
pub mod dispatch;
pub mod gate;
pub mod hub;
pub mod registry;
pub mod security;
pub mod sessions;
pub mod signal;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::GatewayConfig;
pub use gate::{CallContext, SessionGate};
pub use hub::{BroadcastReport, ChatHub, HubError};
pub use parley_common::ConnectionId;
pub use registry::ConnectionRegistry;
pub use sessions::{SessionPresence, SessionStore};
pub use signal::SignalingHub;

use security::{ConnectionLimits, UpgradeLimiter};

const UPGRADE_LIMITER_MAX_ADDRS: usize = 10_000;

/// Shared services of a running gateway. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionStore>,
    pub gate: Arc<SessionGate>,
    pub hub: Arc<ChatHub>,
    pub signaling: Arc<SignalingHub>,
    pub limits: Arc<ConnectionLimits>,
    pub upgrade_limiter: Arc<UpgradeLimiter>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionStore::new());
        Self {
            gate: Arc::new(SessionGate::new(Arc::clone(&sessions))),
            hub: Arc::new(ChatHub::new(Arc::clone(&registry))),
            signaling: Arc::new(SignalingHub::new(Arc::clone(&registry), config.signal_ttl)),
            limits: Arc::new(ConnectionLimits::new(
                config.max_connections,
                config.max_connections_per_ip,
            )),
            upgrade_limiter: Arc::new(UpgradeLimiter::new(
                config.max_upgrades_per_minute,
                Duration::from_secs(60),
                UPGRADE_LIMITER_MAX_ADDRS,
            )),
            config: Arc::new(config),
            registry,
            sessions,
            started_at: Instant::now(),
        }
    }

    /// Force-close a live connection. Its cleanup runs as for a normal close.
    pub async fn evict(&self, id: ConnectionId) -> bool {
        self.registry.evict(&id).await
    }

    pub async fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            active_ws_connections: self.registry.len().await,
            active_channels: self.hub.channel_count().await,
            active_sessions: self.sessions.len().await,
            active_signaling_sessions: self.signaling.len().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMetrics {
    pub active_ws_connections: usize,
    pub active_channels: usize,
    pub active_sessions: usize,
    pub active_signaling_sessions: usize,
    pub uptime_secs: u64,
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.metrics().await)).into_response()
}

async fn prometheus_metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    let metrics = state.metrics().await;

    let prometheus_text = format!(
        r#"# HELP parley_gateway_websocket_connections Active WebSocket connections
# TYPE parley_gateway_websocket_connections gauge
parley_gateway_websocket_connections {active_ws_connections}
# HELP parley_gateway_channels Channels with at least one subscriber
# TYPE parley_gateway_channels gauge
parley_gateway_channels {active_channels}
# HELP parley_gateway_e2ee_sessions Registered E2EE sessions (including expired, unswept)
# TYPE parley_gateway_e2ee_sessions gauge
parley_gateway_e2ee_sessions {active_sessions}
# HELP parley_gateway_signaling_sessions Open signaling sessions
# TYPE parley_gateway_signaling_sessions gauge
parley_gateway_signaling_sessions {active_signaling_sessions}
"#,
        active_ws_connections = metrics.active_ws_connections,
        active_channels = metrics.active_channels,
        active_sessions = metrics.active_sessions,
        active_signaling_sessions = metrics.active_signaling_sessions,
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_text,
    )
}

fn build_cors_layer(config: &GatewayConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-e2ee-session"),
        ]);

    if config.cors_allow_any {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        tracing::warn!("no valid CORS origins configured; cross-origin browser access will be blocked");
        return layer;
    }
    layer.allow_origin(AllowOrigin::list(origins))
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(|| async { "Parley Gateway Online" }))
        .route("/health", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/chat", get(ws::ws_handler))
        .layer(build_cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drop expired session bindings and idle signaling sessions.
pub fn spawn_maintenance(state: GatewayState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        loop {
            interval.tick().await;
            let sessions = state.sessions.sweep_expired().await;
            if sessions > 0 {
                tracing::info!("cleaned {} expired E2EE sessions", sessions);
            }
            state.signaling.sweep_expired().await;
        }
    })
}

/// Serve on an already bound listener until the server stops.
pub async fn serve(listener: TcpListener, state: GatewayState) -> anyhow::Result<()> {
    let maintenance = spawn_maintenance(state.clone());
    let app = router(state);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    maintenance.abort();
    result?;
    Ok(())
}
