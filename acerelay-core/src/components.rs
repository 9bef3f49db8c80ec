//! Mode-dependent wiring of the relay services.
//!
//! The web layer and the CLI receive ready-made components and never branch
//! on the runtime mode themselves.

use std::sync::Arc;

use tracing::info;

use crate::config::RelayConfig;
use crate::engine::{Engine, HttpEngine, SimulatedEngine};
use crate::ids::ContentId;
use crate::probe::{
    InMemoryProbeStorage, ProbeError, ProbeService, StaticCatalog, StreamCatalog,
};
use crate::streaming::ProxyService;
use crate::{RelayError, Result};

/// Demo channels served by development mode when no catalog file is given.
const DEMO_CHANNELS: &[(&str, &[&str])] = &[
    (
        "demo-news",
        &[
            "0000000000000000000000000000000000000001",
            "0000000000000000000000000000000000000002",
        ],
    ),
    ("demo-sports", &["0000000000000000000000000000000000000003"]),
];

/// Services shared by every request handler.
pub struct RelayComponents {
    pub engine: Arc<dyn Engine>,
    pub proxy: Arc<ProxyService>,
    pub probes: Arc<ProbeService>,
    pub catalog: Arc<dyn StreamCatalog>,
}

impl RelayComponents {
    /// Builds the engine, catalog and services for `config.runtime_mode`.
    ///
    /// # Errors
    ///
    /// - `RelayError::Engine` - Engine URL is invalid
    /// - `RelayError::Probe` - Catalog file could not be loaded
    pub fn build(config: &RelayConfig) -> Result<Self> {
        let mode = config.runtime_mode;
        info!(%mode, base_url = %config.engine.base_url, "Using {}", mode.engine_label());

        let engine: Arc<dyn Engine> = if mode.is_development() {
            Arc::new(SimulatedEngine::live())
        } else {
            Arc::new(HttpEngine::new(&config.engine)?)
        };

        let catalog = match &config.catalog_path {
            Some(path) => StaticCatalog::load(path).map_err(ProbeError::from)?,
            None if mode.is_development() => demo_catalog()?,
            None => StaticCatalog::new(),
        };
        info!(channels = catalog.channel_names().count(), "Stream catalog loaded");
        let catalog: Arc<dyn StreamCatalog> = Arc::new(catalog);

        Ok(Self::with_parts(engine, catalog, config))
    }

    /// Wires services around an existing engine and catalog.
    pub fn with_parts(
        engine: Arc<dyn Engine>,
        catalog: Arc<dyn StreamCatalog>,
        config: &RelayConfig,
    ) -> Self {
        let proxy = Arc::new(ProxyService::new(Arc::clone(&engine), config.proxy.clone()));
        let probes = Arc::new(ProbeService::new(
            Arc::clone(&engine),
            Arc::new(InMemoryProbeStorage::new()),
            Arc::clone(&catalog),
            config.probe.clone(),
        ));

        Self {
            engine,
            proxy,
            probes,
            catalog,
        }
    }
}

fn demo_catalog() -> Result<StaticCatalog> {
    let mut catalog = StaticCatalog::new();
    for (name, streams) in DEMO_CHANNELS {
        let streams = streams
            .iter()
            .copied()
            .map(ContentId::parse)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RelayError::Configuration {
                reason: format!("invalid demo stream: {e}"),
            })?;
        catalog = catalog.with_channel(*name, streams);
    }
    Ok(catalog)
}
