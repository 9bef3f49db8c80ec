//! Router construction and server lifecycle.
//!
//! The server owns a shutdown token. Cancelling it stops accepting
//! connections, stops the probe scheduler, and cancels every streaming
//! client so their bodies end and graceful shutdown can complete.

use std::net::SocketAddr;
use std::sync::Arc;

use acerelay_core::config::ServerConfig;
use acerelay_core::{ProbeScheduler, RelayComponents};
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{
    channel_quality, engine_health, get_stream, list_streams, probe_history, probe_metrics,
};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub components: Arc<RelayComponents>,
    /// Parent of every per-client cancellation token
    pub shutdown: CancellationToken,
}

/// Failures that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Builds the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Streaming
        .route("/ace/getstream", get(get_stream))
        .route("/ace/streams", get(list_streams))
        // Probing
        .route("/probes/{info_hash}", get(probe_history))
        .route("/probes/{info_hash}/metrics", get(probe_metrics))
        .route("/quality/{channel_name}", get(channel_quality))
        .route("/health", get(engine_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds `config.host:config.port` and serves until `shutdown` is cancelled.
///
/// # Errors
///
/// - `ServerError::Bind` - The address is invalid or already in use
/// - `ServerError::Serve` - Accepting connections failed
pub async fn run_server(
    config: &ServerConfig,
    components: Arc<RelayComponents>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    serve(listener, components, shutdown).await
}

/// Serves on an already bound listener and runs the probe scheduler
/// alongside.
///
/// # Errors
///
/// - `ServerError::Serve` - Accepting connections failed
pub async fn serve(
    listener: TcpListener,
    components: Arc<RelayComponents>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let local_addr = listener.local_addr().map_err(ServerError::Serve)?;

    let interval = components.probes.config().interval;
    let scheduler =
        ProbeScheduler::new(Arc::clone(&components.probes), interval).spawn(shutdown.clone());

    let state = AppState {
        components,
        shutdown: shutdown.clone(),
    };
    let app = build_router(state);

    log_listening(local_addr);
    let stop = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .map_err(ServerError::Serve);

    // Also reached when serving failed without a shutdown request.
    shutdown.cancel();
    if let Err(error) = scheduler.await {
        warn!(%error, "Probe scheduler task ended abnormally");
    }

    info!("Server stopped");
    served
}

fn log_listening(addr: SocketAddr) {
    info!(%addr, "Acerelay listening on http://{addr}");
}
