//! Mapping of relay errors onto HTTP responses.

use acerelay_core::{ProbeError, StreamingError};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Error response rendered as `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<StreamingError> for ApiError {
    fn from(error: StreamingError) -> Self {
        let status = match &error {
            StreamingError::InvalidContentId => StatusCode::BAD_REQUEST,
            StreamingError::EngineUnavailable { .. }
            | StreamingError::StreamNotActive { .. }
            | StreamingError::ReconnectExhausted { .. }
            | StreamingError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            StreamingError::ReadyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            StreamingError::ClientWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl From<ProbeError> for ApiError {
    fn from(error: ProbeError) -> Self {
        let status = if error.is_not_found() {
            StatusCode::NOT_FOUND
        } else if matches!(error, ProbeError::Validation { .. }) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use acerelay_core::{ContentId, EngineError};

    use super::*;

    fn content_id() -> ContentId {
        ContentId::parse("abc").unwrap()
    }

    #[test]
    fn test_streaming_errors_map_to_gateway_statuses() {
        let unavailable = StreamingError::EngineUnavailable {
            content_id: content_id(),
            source: EngineError::Unavailable {
                reason: "refused".to_string(),
            },
        };
        let timeout = StreamingError::ReadyTimeout {
            content_id: content_id(),
            waited: Duration::from_secs(30),
        };

        assert_eq!(
            ApiError::from(StreamingError::InvalidContentId).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(unavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::from(timeout).status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_missing_probe_data_is_not_found() {
        let error = ApiError::from(ProbeError::NoData {
            info_hash: content_id(),
        });

        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert!(error.message().contains("abc"));
    }
}
