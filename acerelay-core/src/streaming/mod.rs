//! Stream session multiplexing.
//!
//! One upstream engine connection per content identifier is fanned out to
//! any number of HTTP clients. The registry tracks which sessions exist, the
//! broadcaster copies upstream bytes into per-client buffers, and the proxy
//! service ties session lifecycle, reconnection and teardown together.

pub mod broadcaster;
pub mod proxy;
pub mod registry;
pub mod timeout_writer;

use std::time::Duration;

pub use broadcaster::{BroadcastSink, Broadcaster, Subscription};
pub use proxy::{AttachedClient, ProxyService};
pub use registry::{SessionRegistry, SessionSnapshot, StreamSession};
pub use timeout_writer::{TimeoutWriter, WriteError};

use crate::engine::EngineError;
use crate::ids::ContentId;

/// Errors surfaced to clients of the multiplexer.
///
/// Cloneable because a single terminal error is delivered to every client
/// attached to a session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamingError {
    #[error("invalid content identifier")]
    InvalidContentId,

    #[error("engine unavailable for {content_id}: {source}")]
    EngineUnavailable {
        content_id: ContentId,
        source: EngineError,
    },

    #[error("stream {content_id} is not active")]
    StreamNotActive { content_id: ContentId },

    #[error("stream {content_id} not ready after {waited:?}")]
    ReadyTimeout {
        content_id: ContentId,
        waited: Duration,
    },

    #[error("client write failed: {0}")]
    ClientWrite(#[from] WriteError),

    #[error("stream {content_id} failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        content_id: ContentId,
        attempts: u32,
        last_error: EngineError,
    },

    #[error("client cancelled")]
    Cancelled,
}

impl StreamingError {
    /// True for errors caused by the client's own request.
    pub fn is_user_error(&self) -> bool {
        matches!(self, StreamingError::InvalidContentId)
    }

    /// True when the client was dropped for not keeping up.
    pub fn is_slow_client(&self) -> bool {
        matches!(self, StreamingError::ClientWrite(error) if error.is_timeout())
    }
}
