//! Multiplexed stream delivery.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::error::ApiError;
use crate::server::AppState;

/// Bytes buffered between the client task and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Query parameters for `/ace/getstream`
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Content identifier of the requested stream
    #[serde(default)]
    pub id: Option<String>,
}

/// Streams `?id=` to the caller as chunked `video/mpeg`.
///
/// Setup errors are reported with a status code before any byte is sent.
/// The client is detached when the response body is dropped or the server
/// shuts down.
pub async fn get_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let raw_id = query.id.unwrap_or_default();
    let cancel = state.shutdown.child_token();

    let client = state.components.proxy.attach(&cancel, &raw_id).await?;
    let client_id = client.client_id();
    let content_id = client.content_id().clone();

    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let client_cancel = cancel.clone();
    tokio::spawn(async move {
        // Outcome is logged by the client itself.
        let _ = client.stream(writer, &client_cancel).await;
    });

    // Dropping the body, e.g. on client disconnect, cancels the client task.
    let disconnect = cancel.drop_guard();
    let body = ReaderStream::new(reader).map(move |chunk| {
        let _ = &disconnect;
        chunk
    });

    debug!(%content_id, %client_id, "Streaming response started");

    Ok((
        [
            (CONTENT_TYPE, "video/mpeg"),
            (CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (PRAGMA, "no-cache"),
            (EXPIRES, "0"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}
