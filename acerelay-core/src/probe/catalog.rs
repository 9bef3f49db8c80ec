//! Channel to stream lookup used by the prober.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::ids::ContentId;

/// Source of the streams known to the relay.
#[async_trait]
pub trait StreamCatalog: Send + Sync {
    /// Every known stream, without duplicates.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Unavailable` - If the catalog could not be read
    async fn all_streams(&self) -> Result<Vec<ContentId>, CatalogError>;

    /// Streams carrying `channel`.
    ///
    /// # Errors
    ///
    /// - `CatalogError::UnknownChannel` - If no channel has that name
    async fn streams_for_channel(&self, channel: &str) -> Result<Vec<ContentId>, CatalogError>;

    /// Names of every channel, sorted.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Unavailable` - If the catalog could not be read
    async fn channels(&self) -> Result<Vec<String>, CatalogError>;
}

/// Errors raised while loading or querying a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown channel: {name}")]
    UnknownChannel { name: String },

    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog: {reason}")]
    Invalid { reason: String },

    #[error("catalog unavailable: {reason}")]
    Unavailable { reason: String },
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    channels: BTreeMap<String, Vec<String>>,
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    channels: BTreeMap<String, Vec<ContentId>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a channel with its streams.
    pub fn with_channel(
        mut self,
        name: impl Into<String>,
        streams: impl IntoIterator<Item = ContentId>,
    ) -> Self {
        self.channels
            .insert(name.into(), streams.into_iter().collect());
        self
    }

    /// Parses a catalog of the form `{"channels": {"name": ["infohash", ...]}}`.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Invalid` - Malformed JSON or an empty stream identifier
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json).map_err(|e| CatalogError::Invalid {
            reason: e.to_string(),
        })?;

        let mut catalog = Self::new();
        for (name, raw_streams) in file.channels {
            let streams = raw_streams
                .iter()
                .map(|raw| {
                    ContentId::parse(raw).map_err(|_| CatalogError::Invalid {
                        reason: format!("channel {name} lists an empty stream id"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            catalog.channels.insert(name, streams);
        }
        Ok(catalog)
    }

    /// Loads a catalog file.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Io` - File could not be read
    /// - `CatalogError::Invalid` - File contents are malformed
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl StreamCatalog for StaticCatalog {
    async fn all_streams(&self) -> Result<Vec<ContentId>, CatalogError> {
        let unique: BTreeSet<&ContentId> = self.channels.values().flatten().collect();
        Ok(unique.into_iter().cloned().collect())
    }

    async fn streams_for_channel(&self, channel: &str) -> Result<Vec<ContentId>, CatalogError> {
        self.channels
            .get(channel)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownChannel {
                name: channel.to_string(),
            })
    }

    async fn channels(&self) -> Result<Vec<String>, CatalogError> {
        Ok(self.channels.keys().cloned().collect())
    }
}
