use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::auth::Authenticator;
use super::connection::ws_handler;
use crate::sandbox::SandboxSupervisor;
use crate::session::{SessionInfo, SessionRegistry};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Time a new connection has to send its `attach` frame.
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A connection silent for this long is treated as lost.
    pub heartbeat_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 39390)),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Shared state of the HTTP/WebSocket server.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<SandboxSupervisor>,
    pub authenticator: Arc<Authenticator>,
    pub config: Arc<RelayConfig>,
}

pub struct RelayServer {
    state: RelayState,
}

impl RelayServer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        supervisor: Arc<SandboxSupervisor>,
        authenticator: Authenticator,
        config: RelayConfig,
    ) -> Self {
        Self {
            state: RelayState {
                registry,
                supervisor,
                authenticator: Arc::new(authenticator),
                config: Arc::new(config),
            },
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", any(ws_handler))
            .route("/healthz", get(health))
            .route("/sessions", get(list_sessions))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` fires, then close every session and sandbox.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        let supervisor = Arc::clone(&self.state.supervisor);
        let registry = Arc::clone(&self.state.registry);

        supervisor.health_check().await;
        let monitor = supervisor
            .spawn_health_monitor(self.state.config.health_check_interval, shutdown.child_token());

        info!(
            "Relay listening on {} ({} runtime, auth: {})",
            listener.local_addr()?,
            supervisor.runtime_name(),
            self.state.authenticator.policy().name()
        );

        let app = self.router();
        let signal = {
            let registry = Arc::clone(&registry);
            let supervisor = Arc::clone(&supervisor);
            async move {
                shutdown.cancelled().await;
                info!("Shutting down: closing sessions");
                // Ending sessions closes their sockets, which lets the
                // server's graceful shutdown complete.
                registry.shutdown().await;
                supervisor.shutdown().await;
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        monitor.abort();
        registry.shutdown().await;
        supervisor.shutdown().await;
        info!("Relay stopped");
        Ok(())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    runtime: &'static str,
    sessions: usize,
    sandboxes: usize,
    version: &'static str,
}

async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    let healthy = state.supervisor.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            runtime: state.supervisor.runtime_name(),
            sessions: state.registry.len(),
            sandboxes: state.supervisor.live_count(),
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Sessions visible to the caller. Takes the handshake credential as a
/// bearer token and only lists sessions the caller could resume.
async fn list_sessions(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionInfo>>, StatusCode> {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    let identity = state.authenticator.authenticate(credential).map_err(|e| {
        warn!("Session listing refused: {}", e);
        StatusCode::UNAUTHORIZED
    })?;
    Ok(Json(
        state
            .registry
            .list_owned_by(identity.client_id.as_deref()),
    ))
}
