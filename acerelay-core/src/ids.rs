//! Identifiers shared by the proxy and probing subsystems.
//!
//! Content identifiers arrive from untrusted HTTP input and are validated
//! once at the boundary. Client and probe identifiers are engine PIDs drawn
//! from a single process-wide atomic counter.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque identifier of an upstream media stream.
///
/// For the engine this is usually a 40 character content hash, but the proxy
/// only requires it to be non-empty once surrounding whitespace is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Validates and wraps a raw identifier.
    ///
    /// # Errors
    ///
    /// - `InvalidContentId` - If the identifier is empty or only whitespace
    pub fn parse(raw: &str) -> Result<Self, InvalidContentId> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidContentId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ContentId {
    type Err = InvalidContentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rejected content identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("content identifier must not be empty")]
pub struct InvalidContentId;

/// Engine player identifier.
///
/// Every attached client and every probe gets its own PID. The client that
/// creates a session lends its PID to the upstream connection, so the engine
/// sees exactly one player per active stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u64);

impl Pid {
    /// Wraps a raw PID value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw PID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection client identifier. A client is identified by its PID.
pub type ClientId = Pid;

/// Monotonic PID source.
#[derive(Debug)]
pub struct PidAllocator {
    next: AtomicU64,
}

impl PidAllocator {
    /// Creates an allocator whose first PID is `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Returns a PID never handed out before by this allocator.
    pub fn next_pid(&self) -> Pid {
        Pid(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

static PROCESS_PIDS: OnceLock<PidAllocator> = OnceLock::new();

/// Allocates a PID from the process-wide counter.
///
/// The counter is seeded randomly on first use so PIDs from a restarted
/// process do not collide with players the engine still remembers.
pub fn next_pid() -> Pid {
    PROCESS_PIDS
        .get_or_init(|| PidAllocator::with_seed(u64::from(rand::random::<u32>()) << 16))
        .next_pid()
}
