//! Relay configuration.
//!
//! Defaults match a local engine on its standard port. Deployments adjust
//! them through `ACERELAY_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::mode::RuntimeMode;

/// Settings for every relay component, one section per subsystem.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub engine: EngineConfig,
    pub proxy: ProxyConfig,
    pub probe: ProbeConfig,
    pub server: ServerConfig,
    /// JSON file describing channels and their streams
    pub catalog_path: Option<PathBuf>,
    pub runtime_mode: RuntimeMode,
}

/// Upstream engine connection settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the engine HTTP API
    pub base_url: String,
    /// Timeout for control requests (start, stats, stop)
    pub request_timeout: Duration,
    /// Timeout for the health check request
    pub ping_timeout: Duration,
    /// Largest chunk handed to the broadcaster in one write
    pub copy_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:6878".to_string(),
            request_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            copy_chunk_size: 32 * 1024, // 32 KiB
        }
    }
}

/// Session multiplexing and client delivery settings.
///
/// Controls how long joining clients wait for a starting session, how
/// aggressively a broken upstream is reconnected, and how much a slow
/// client may lag before it is evicted.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum time a joining client waits for the session to become ready
    pub ready_timeout: Duration,
    /// Total upstream copy attempts before the session fails
    pub max_attempts: u32,
    /// Backoff before the first reconnect, doubled for each further attempt
    pub base_backoff: Duration,
    /// Chunks buffered per client before it counts as slow
    pub client_buffer_chunks: usize,
    /// Deadline for a single write to a client or to the broadcaster
    pub write_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            client_buffer_chunks: 256,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Health probing settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Upper bound on a single probe (start, stats and stop)
    pub probe_timeout: Duration,
    /// Span of probe history aggregated into metrics
    pub rolling_window: Duration,
    /// Delay between scheduled probe cycles
    pub interval: Duration,
    /// Pause between a successful start and the stats request
    pub stats_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(30 * 60),
            stats_delay: Duration::from_secs(5),
        }
    }
}

impl ProbeConfig {
    /// Results older than this are deleted by cleanup.
    pub fn retention(&self) -> Duration {
        self.rolling_window * 2
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by any `ACERELAY_*` variables that are set.
    ///
    /// Malformed values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("ACERELAY_ENGINE_URL") {
            config.engine.base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(seconds) = env_parse::<u64>("ACERELAY_WRITE_TIMEOUT") {
            config.proxy.write_timeout = Duration::from_secs(seconds);
        }

        if let Some(chunks) = env_parse::<usize>("ACERELAY_CLIENT_BUFFER") {
            config.proxy.client_buffer_chunks = chunks.max(1);
        }

        if let Some(seconds) = env_parse::<u64>("ACERELAY_PROBE_INTERVAL") {
            config.probe.interval = Duration::from_secs(seconds);
        }

        if let Some(hours) = env_parse::<u64>("ACERELAY_PROBE_WINDOW") {
            config.probe.rolling_window = Duration::from_secs(hours * 60 * 60);
        }

        if let Ok(host) = std::env::var("ACERELAY_HOST") {
            config.server.host = host;
        }

        if let Some(port) = env_parse::<u16>("ACERELAY_PORT") {
            config.server.port = port;
        }

        if let Ok(path) = std::env::var("ACERELAY_CATALOG") {
            config.catalog_path = Some(PathBuf::from(path));
        }

        if let Some(mode) = env_parse::<RuntimeMode>("ACERELAY_MODE") {
            config.runtime_mode = mode;
        }

        config
    }

    /// Development-mode configuration whose timeouts and backoffs finish in
    /// milliseconds.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig {
                request_timeout: Duration::from_secs(2),
                ping_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            proxy: ProxyConfig {
                ready_timeout: Duration::from_secs(2),
                base_backoff: Duration::from_millis(10),
                client_buffer_chunks: 16,
                write_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            probe: ProbeConfig {
                probe_timeout: Duration::from_secs(1),
                interval: Duration::from_millis(50),
                stats_delay: Duration::ZERO,
                ..Default::default()
            },
            runtime_mode: RuntimeMode::Development,
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
