//! Probe result persistence port.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::ProbeResult;
use crate::ids::ContentId;

/// Storage for probe history.
///
/// Results come back ordered by timestamp, oldest first.
#[async_trait]
pub trait ProbeStorage: Send + Sync {
    /// Persists a probe result.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store rejected the write
    async fn save(&self, result: &ProbeResult) -> Result<(), StorageError>;

    /// Returns results for `info_hash` with a timestamp at or after `since`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store could not be read
    async fn find_by_info_hash_since(
        &self,
        info_hash: &ContentId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, StorageError>;

    /// Deletes every result with a timestamp strictly before `cutoff`.
    ///
    /// Returns the number of deleted results.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store rejected the delete
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Errors raised by probe storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("probe storage failed: {reason}")]
    Backend { reason: String },
}

/// Process-local probe storage.
#[derive(Default)]
pub struct InMemoryProbeStorage {
    results: RwLock<HashMap<ContentId, Vec<ProbeResult>>>,
}

impl InMemoryProbeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored results.
    pub fn len(&self) -> usize {
        self.results.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProbeStorage for InMemoryProbeStorage {
    async fn save(&self, result: &ProbeResult) -> Result<(), StorageError> {
        let mut results = self.results.write();
        let history = results.entry(result.info_hash().clone()).or_default();
        // Equal timestamps keep insertion order.
        let position = history.partition_point(|stored| stored.timestamp() <= result.timestamp());
        history.insert(position, result.clone());
        Ok(())
    }

    async fn find_by_info_hash_since(
        &self,
        info_hash: &ContentId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, StorageError> {
        let results = self.results.read();
        let Some(history) = results.get(info_hash) else {
            return Ok(Vec::new());
        };
        let start = history.partition_point(|stored| stored.timestamp() < since);
        Ok(history[start..].to_vec())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut results = self.results.write();
        let mut deleted = 0;

        results.retain(|_, history| {
            let stale = history.partition_point(|stored| stored.timestamp() < cutoff);
            history.drain(..stale);
            deleted += stale;
            !history.is_empty()
        });

        Ok(deleted)
    }
}
