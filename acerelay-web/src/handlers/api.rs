//! JSON handlers for sessions, probe data and engine health

use acerelay_core::{ContentId, Metrics, ProbeResult, SessionSnapshot, StreamQuality};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::warn;

use super::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    pub streams: Vec<SessionSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_error: Option<String>,
    pub active_sessions: usize,
}

fn parse_info_hash(raw: &str) -> Result<ContentId, ApiError> {
    ContentId::parse(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

/// Active sessions with their attached client PIDs.
pub async fn list_streams(State(state): State<AppState>) -> Json<StreamsResponse> {
    Json(StreamsResponse {
        streams: state.components.proxy.sessions(),
    })
}

/// Stored probe results for one stream, newest first.
pub async fn probe_history(
    State(state): State<AppState>,
    Path(info_hash): Path<String>,
) -> Result<Json<Vec<ProbeResult>>, ApiError> {
    let info_hash = parse_info_hash(&info_hash)?;
    let results = state.components.probes.recent_probes(&info_hash).await?;
    Ok(Json(results))
}

/// Rolling-window metrics for one stream, 404 without data.
pub async fn probe_metrics(
    State(state): State<AppState>,
    Path(info_hash): Path<String>,
) -> Result<Json<Metrics>, ApiError> {
    let info_hash = parse_info_hash(&info_hash)?;
    let metrics = state.components.probes.get_metrics(&info_hash).await?;
    Ok(Json(metrics))
}

/// Streams of a channel ranked best first.
pub async fn channel_quality(
    State(state): State<AppState>,
    Path(channel_name): Path<String>,
) -> Result<Json<Vec<StreamQuality>>, ApiError> {
    let ranked = state
        .components
        .probes
        .get_quality_scores(&channel_name)
        .await?;
    Ok(Json(ranked))
}

/// Engine reachability and session count. 503 while the engine is down.
pub async fn engine_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let active_sessions = state.components.proxy.registry().len();

    match state.components.engine.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                engine_reachable: true,
                engine_error: None,
                active_sessions,
            }),
        ),
        Err(error) => {
            warn!(%error, "Engine health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    engine_reachable: false,
                    engine_error: Some(error.to_string()),
                    active_sessions,
                }),
            )
        }
    }
}
