//! Axum-based relay server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::connection::handle_relay_connection;
use crate::state::RelayState;

const MAX_SESSION_NAME: usize = 128;

/// Routes: `/ws/{session}` for peers and `/health` for probes.
pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws/{session}", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the relay and serve until Ctrl+C.
pub async fn start_relay(state: Arc<RelayState>, port: u16) -> anyhow::Result<()> {
    #[allow(unused_mut)]
    let mut app = relay_router(state.clone());

    #[cfg(feature = "metrics")]
    {
        match crate::metrics::install_prometheus_recorder() {
            Ok(handle) => {
                app = app.route(
                    "/metrics",
                    get(move || {
                        let handle = handle.clone();
                        async move { handle.render() }
                    }),
                );
                info!("Prometheus metrics at /metrics");
            }
            Err(e) => tracing::warn!(%e, "Metrics recorder unavailable"),
        }
    }

    let addr = format!("{}:{port}", state.bind);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Relay listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Relay stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let session = session.trim().to_string();
    if session.is_empty() || session.len() > MAX_SESSION_NAME {
        return (StatusCode::BAD_REQUEST, "Invalid session name").into_response();
    }

    let ip = addr.ip();
    let admission = match &state.rate_limiter {
        Some(limiter) => match limiter.check(ip) {
            Some(admission) => Some(admission),
            None => {
                return (StatusCode::TOO_MANY_REQUESTS, "Too many connections").into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_relay_connection(state, socket, session, ip, admission))
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "rooms": state.room_count().await,
        "connections": state.connection_count().await,
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "Failed to install Ctrl+C handler; relay runs until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
