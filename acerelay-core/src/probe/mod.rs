//! Stream health probing and quality ranking.
//!
//! Every known stream is periodically started under a probe-only PID, its
//! swarm statistics recorded, and the player stopped again. Results are kept
//! for twice the rolling window and reduced into [`Metrics`] and relative
//! quality scores on demand.

pub mod catalog;
pub mod metrics;
pub mod result;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use catalog::{CatalogError, StaticCatalog, StreamCatalog};
pub use metrics::{Metrics, StreamQuality, compute_quality_score, rank_streams};
pub use result::ProbeResult;
pub use scheduler::ProbeScheduler;
pub use service::{ProbeCycleSummary, ProbeService};
pub use storage::{InMemoryProbeStorage, ProbeStorage, StorageError};

use crate::ids::ContentId;

/// Errors raised by the probing subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no probe data for {info_hash}")]
    NoData { info_hash: ContentId },

    #[error("invalid probe result: {reason}")]
    Validation { reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    /// True when the requested stream or channel does not exist or has no data.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProbeError::NoData { .. } | ProbeError::Catalog(CatalogError::UnknownChannel { .. })
        )
    }
}
