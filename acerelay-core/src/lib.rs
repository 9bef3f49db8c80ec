//! Acerelay Core - Stream multiplexing and health probing
//!
//! This crate provides the building blocks for relaying a scarce media
//! engine to many HTTP clients: the engine port and its adapters, session
//! multiplexing with slow-client eviction and reconnection, and periodic
//! stream probing with quality ranking.

pub mod components;
pub mod config;
pub mod engine;
pub mod ids;
pub mod mode;
pub mod probe;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use components::RelayComponents;
pub use config::RelayConfig;
pub use engine::{Engine, EngineError, EngineStats, HttpEngine, SimulatedEngine};
pub use ids::{ClientId, ContentId, Pid};
pub use mode::RuntimeMode;
pub use probe::{
    InMemoryProbeStorage, Metrics, ProbeError, ProbeResult, ProbeScheduler, ProbeService,
    ProbeStorage, StaticCatalog, StreamCatalog, StreamQuality,
};
pub use streaming::{ProxyService, SessionRegistry, SessionSnapshot, StreamingError};

/// Errors that can bubble up from any Acerelay subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Engine(EngineError::Unavailable { .. } | EngineError::Timeout { .. }) => {
                "Media engine is not reachable".to_string()
            }
            RelayError::Engine(_) => "Media engine error occurred".to_string(),
            RelayError::Streaming(e) => match e {
                StreamingError::InvalidContentId => "Missing or invalid stream id".to_string(),
                StreamingError::EngineUnavailable { content_id, .. } => {
                    format!("Could not start stream {content_id}")
                }
                StreamingError::ReadyTimeout { content_id, .. } => {
                    format!("Stream {content_id} did not start in time")
                }
                StreamingError::ReconnectExhausted { content_id, .. } => {
                    format!("Stream {content_id} was lost")
                }
                _ => "Streaming error occurred".to_string(),
            },
            RelayError::Probe(e) => match e {
                ProbeError::NoData { info_hash } => format!("No probe data for {info_hash}"),
                ProbeError::Catalog(probe::CatalogError::UnknownChannel { name }) => {
                    format!("Unknown channel {name}")
                }
                _ => "Probe error occurred".to_string(),
            },
            RelayError::Configuration { .. } => "Configuration error occurred".to_string(),
            RelayError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        match self {
            RelayError::Streaming(e) => e.is_user_error(),
            RelayError::Configuration { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
