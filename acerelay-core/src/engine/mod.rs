//! Upstream media engine port.
//!
//! The engine is scarce and stateful: every player it runs is keyed by a PID
//! and costs real bandwidth. The proxy and the prober only ever talk to it
//! through the [`Engine`] trait so the HTTP adapter and the simulated engine
//! are interchangeable.

pub mod http;
pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

pub use http::HttpEngine;
pub use simulated::SimulatedEngine;

use crate::ids::{ContentId, Pid};
use crate::streaming::WriteError;

/// Swarm statistics reported for a running player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub peers: u32,
    /// Download speed in bytes per second
    pub speed_down: u64,
    pub status: String,
}

/// Parameters for copying a started stream into a destination.
#[derive(Debug, Clone, Copy)]
pub struct StreamRequest<'a> {
    pub stream_url: &'a str,
    pub content_id: &'a ContentId,
    pub pid: Pid,
    /// Deadline for each write into the destination
    pub write_timeout: Duration,
}

/// Operations the relay needs from the media engine.
///
/// Implementations must tolerate concurrent calls for different PIDs.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Starts a player for `content_id` under `pid` and returns its playback URL.
    ///
    /// Calling it again for a PID that is already playing restarts that player.
    ///
    /// # Errors
    ///
    /// - `EngineError::Unavailable` - Engine could not be reached
    /// - `EngineError::Rejected` - Engine refused to start the content
    /// - `EngineError::InvalidResponse` - Engine answered with something unparseable
    async fn start_stream(&self, content_id: &ContentId, pid: Pid) -> Result<String, EngineError>;

    /// Fetches swarm statistics for a running player.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPid` - No player was started for `pid`
    /// - `EngineError::Unavailable` - Engine could not be reached
    async fn stats(&self, pid: Pid) -> Result<EngineStats, EngineError>;

    /// Stops the player running under `pid`.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPid` - No player was started for `pid`
    /// - `EngineError::Unavailable` - Engine could not be reached
    async fn stop_stream(&self, pid: Pid) -> Result<(), EngineError>;

    /// Copies raw stream bytes into `destination` until the stream ends.
    ///
    /// Returns the number of bytes copied. Blocks for as long as the stream
    /// is live.
    ///
    /// # Errors
    ///
    /// - `EngineError::Cancelled` - `cancel` fired before the stream ended
    /// - `EngineError::Upstream` - Reading from the engine failed mid-stream
    /// - `EngineError::Destination` - Writing into `destination` failed or timed out
    async fn stream_content(
        &self,
        request: StreamRequest<'_>,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<u64, EngineError>;

    /// Checks that the engine is reachable.
    ///
    /// # Errors
    ///
    /// - `EngineError::Unavailable` - Engine could not be reached
    async fn ping(&self) -> Result<(), EngineError>;
}

/// Errors reported by engine adapters.
///
/// Cloneable so that one upstream failure can be handed to every client
/// attached to the failing session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("engine rejected request: {reason}")]
    Rejected { reason: String },

    #[error("invalid engine response: {reason}")]
    InvalidResponse { reason: String },

    #[error("no player started for pid {pid}")]
    UnknownPid { pid: Pid },

    #[error("engine request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("upstream read failed: {reason}")]
    Upstream { reason: String },

    #[error("destination write failed: {0}")]
    Destination(#[from] WriteError),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Cancellation is the one failure a relay must never retry.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            EngineError::InvalidResponse {
                reason: error.to_string(),
            }
        } else if error.is_body() {
            EngineError::Upstream {
                reason: error.to_string(),
            }
        } else {
            EngineError::Unavailable {
                reason: error.to_string(),
            }
        }
    }
}
