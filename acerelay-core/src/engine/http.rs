//! HTTP adapter for the media engine API.
//!
//! Players are started with `/ace/getstream?format=json`, which answers with
//! per-player URLs for playback, statistics and commands. Those URLs are
//! remembered per PID until the player is stopped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::{Engine, EngineError, EngineStats, StreamRequest};
use crate::config::EngineConfig;
use crate::ids::{ContentId, Pid};
use crate::streaming::TimeoutWriter;

/// Engine reached over its HTTP API.
pub struct HttpEngine {
    base_url: Url,
    client: reqwest::Client,
    request_timeout: Duration,
    ping_timeout: Duration,
    copy_chunk_size: usize,
    players: Mutex<HashMap<Pid, PlayerUrls>>,
}

/// URLs the engine hands out for one running player.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlayerUrls {
    pub playback_url: String,
    pub stat_url: String,
    pub command_url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    peers: u32,
    /// KiB per second
    #[serde(default)]
    speed_down: u64,
    #[serde(default)]
    status: String,
}

impl HttpEngine {
    /// Creates an adapter for the engine at `config.base_url`.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidResponse` - Base URL is not a valid URL
    /// - `EngineError::Unavailable` - HTTP client could not be built
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| EngineError::InvalidResponse {
            reason: format!("invalid engine URL {}: {e}", config.base_url),
        })?;

        // No overall timeout: playback responses last as long as the stream.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .user_agent(concat!("acerelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url,
            client,
            request_timeout: config.request_timeout,
            ping_timeout: config.ping_timeout,
            copy_chunk_size: config.copy_chunk_size.max(1),
            players: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the URLs recorded for a running player.
    pub fn player(&self, pid: Pid) -> Option<PlayerUrls> {
        self.players.lock().get(&pid).cloned()
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, EngineError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| EngineError::InvalidResponse {
                reason: format!("invalid engine path {path}: {e}"),
            })?;
        url.query_pairs_mut().extend_pairs(params);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        timeout: Duration,
    ) -> Result<T, EngineError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Rejected {
                reason: format!("engine returned HTTP {status}"),
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| request_error(e, timeout))?;

        if let Some(error) = envelope.error.filter(|error| !error.is_empty()) {
            return Err(EngineError::Rejected { reason: error });
        }
        envelope.response.ok_or_else(|| EngineError::InvalidResponse {
            reason: "engine response has no payload".to_string(),
        })
    }
}

fn request_error(error: reqwest::Error, after: Duration) -> EngineError {
    if error.is_timeout() {
        EngineError::Timeout { after }
    } else {
        EngineError::from(error)
    }
}

/// Engine statistics report download speed in KiB/s.
fn stats_from_response(stats: StatsResponse) -> EngineStats {
    EngineStats {
        peers: stats.peers,
        speed_down: stats.speed_down.saturating_mul(1024),
        status: stats.status,
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn start_stream(&self, content_id: &ContentId, pid: Pid) -> Result<String, EngineError> {
        let pid_param = pid.to_string();
        let url = self.endpoint(
            "/ace/getstream",
            &[
                ("format", "json"),
                ("id", content_id.as_str()),
                ("pid", &pid_param),
            ],
        )?;

        let player: PlayerUrls = self.get_json(url, self.request_timeout).await?;
        let playback_url = player.playback_url.clone();
        self.players.lock().insert(pid, player);

        info!(%content_id, %pid, "Engine player started");
        Ok(playback_url)
    }

    async fn stats(&self, pid: Pid) -> Result<EngineStats, EngineError> {
        let player = self.player(pid).ok_or(EngineError::UnknownPid { pid })?;
        let url = Url::parse(&player.stat_url).map_err(|e| EngineError::InvalidResponse {
            reason: format!("invalid stat URL: {e}"),
        })?;

        let stats: StatsResponse = self.get_json(url, self.request_timeout).await?;
        Ok(stats_from_response(stats))
    }

    async fn stop_stream(&self, pid: Pid) -> Result<(), EngineError> {
        let player = self
            .players
            .lock()
            .remove(&pid)
            .ok_or(EngineError::UnknownPid { pid })?;

        let mut url = Url::parse(&player.command_url).map_err(|e| EngineError::InvalidResponse {
            reason: format!("invalid command URL: {e}"),
        })?;
        url.query_pairs_mut().append_pair("method", "stop");

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error(e, self.request_timeout))?;

        if !response.status().is_success() {
            return Err(EngineError::Rejected {
                reason: format!("stop returned HTTP {}", response.status()),
            });
        }
        debug!(%pid, "Engine player stopped");
        Ok(())
    }

    async fn stream_content(
        &self,
        request: StreamRequest<'_>,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<u64, EngineError> {
        let content_id = request.content_id;
        let pid = request.pid;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            response = self.client.get(request.stream_url).send() => response?,
        };
        if !response.status().is_success() {
            return Err(EngineError::Upstream {
                reason: format!("playback returned HTTP {}", response.status()),
            });
        }

        let mut body = response.bytes_stream();
        let mut writer = TimeoutWriter::new(destination, request.write_timeout);
        let mut copied = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => {
                    return Err(EngineError::Upstream {
                        reason: error.to_string(),
                    });
                }
                None => break,
            };

            for piece in chunk.chunks(self.copy_chunk_size) {
                copied += writer.write_chunk(piece).await? as u64;
            }
        }

        debug!(%content_id, %pid, copied, "Playback stream ended");
        Ok(copied)
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let url = self.endpoint("/webui/api/service", &[("method", "get_version")])?;
        let response = self
            .client
            .get(url)
            .timeout(self.ping_timeout)
            .send()
            .await
            .map_err(|e| request_error(e, self.ping_timeout))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Unavailable {
                reason: format!("engine health check returned HTTP {}", response.status()),
            })
        }
    }
}
