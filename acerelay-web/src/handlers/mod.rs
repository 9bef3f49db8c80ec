//! HTTP request handlers organized by functionality

pub mod api;
pub mod error;
pub mod streaming;

// Re-export handler functions
pub use api::{
    HealthResponse, StreamsResponse, channel_quality, engine_health, list_streams, probe_history,
    probe_metrics,
};
pub use error::ApiError;
pub use streaming::{StreamQuery, get_stream};
