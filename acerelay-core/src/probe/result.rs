//! Immutable record of a single health probe.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProbeError;
use crate::engine::EngineStats;
use crate::ids::ContentId;

/// Outcome of probing one stream at one point in time.
///
/// Constructors validate their input. A timestamp equal to the UNIX epoch
/// counts as unset and is rejected. Results loaded back from storage are
/// deserialized as-is, since they were validated when first recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    info_hash: ContentId,
    timestamp: DateTime<Utc>,
    available: bool,
    startup_latency_ms: u64,
    peer_count: u32,
    /// Bytes per second
    download_speed: u64,
    status: String,
    error_message: Option<String>,
}

impl ProbeResult {
    /// Stream started and reported statistics.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Validation` - Empty identifier or zero timestamp
    pub fn available(
        info_hash: ContentId,
        timestamp: DateTime<Utc>,
        startup_latency: Duration,
        stats: &EngineStats,
    ) -> Result<Self, ProbeError> {
        Self::validated(Self {
            info_hash,
            timestamp,
            available: true,
            startup_latency_ms: duration_ms(startup_latency),
            peer_count: stats.peers,
            download_speed: stats.speed_down,
            status: stats.status.clone(),
            error_message: None,
        })
    }

    /// Stream started but its statistics could not be fetched.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Validation` - Empty identifier or zero timestamp
    pub fn partial(
        info_hash: ContentId,
        timestamp: DateTime<Utc>,
        startup_latency: Duration,
        error_message: impl Into<String>,
    ) -> Result<Self, ProbeError> {
        Self::validated(Self {
            info_hash,
            timestamp,
            available: true,
            startup_latency_ms: duration_ms(startup_latency),
            peer_count: 0,
            download_speed: 0,
            status: "unknown".to_string(),
            error_message: Some(error_message.into()),
        })
    }

    /// Stream could not be started.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Validation` - Empty identifier or zero timestamp
    pub fn unavailable(
        info_hash: ContentId,
        timestamp: DateTime<Utc>,
        error_message: impl Into<String>,
    ) -> Result<Self, ProbeError> {
        Self::validated(Self {
            info_hash,
            timestamp,
            available: false,
            startup_latency_ms: 0,
            peer_count: 0,
            download_speed: 0,
            status: "unavailable".to_string(),
            error_message: Some(error_message.into()),
        })
    }

    fn validated(result: Self) -> Result<Self, ProbeError> {
        if result.info_hash.as_str().trim().is_empty() {
            return Err(ProbeError::Validation {
                reason: "info hash must not be empty".to_string(),
            });
        }
        if result.timestamp == DateTime::<Utc>::UNIX_EPOCH {
            return Err(ProbeError::Validation {
                reason: "timestamp must be set".to_string(),
            });
        }
        Ok(result)
    }

    pub fn info_hash(&self) -> &ContentId {
        &self.info_hash
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn startup_latency(&self) -> Duration {
        Duration::from_millis(self.startup_latency_ms)
    }

    pub fn startup_latency_ms(&self) -> u64 {
        self.startup_latency_ms
    }

    pub fn peer_count(&self) -> u32 {
        self.peer_count
    }

    /// Download speed in bytes per second.
    pub fn download_speed(&self) -> u64 {
        self.download_speed
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
