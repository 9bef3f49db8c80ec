//! In-process engine used for development mode and tests.
//!
//! Serves either a fixed payload or an endless MPEG-TS feed of null packets,
//! and supports failure injection for every engine operation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Engine, EngineError, EngineStats, StreamRequest};
use crate::ids::{ContentId, Pid};
use crate::streaming::TimeoutWriter;

const TS_PACKET_SIZE: usize = 188;
const TS_PACKETS_PER_CHUNK: usize = 7;
const LIVE_CHUNK_INTERVAL: Duration = Duration::from_millis(20);

/// Engine double with a scriptable payload and failure injection.
pub struct SimulatedEngine {
    payload: Payload,
    start_delay: Duration,
    stats: EngineStats,
    state: Mutex<SimulatedState>,
}

enum Payload {
    Fixed(Vec<Bytes>),
    Live(Bytes),
}

#[derive(Default)]
struct SimulatedState {
    players: HashMap<Pid, ContentId>,
    unplayable: HashSet<ContentId>,
    failing_starts: u32,
    failing_streams: u32,
    failing_stats: bool,
    offline: bool,
    start_calls: usize,
    stop_calls: usize,
    stream_calls: usize,
    stats_calls: usize,
}

impl SimulatedEngine {
    /// Engine whose streams end immediately without data.
    pub fn new() -> Self {
        Self {
            payload: Payload::Fixed(Vec::new()),
            start_delay: Duration::ZERO,
            stats: EngineStats {
                peers: 12,
                speed_down: 512 * 1024,
                status: "dl".to_string(),
            },
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Engine whose streams never end until cancelled.
    pub fn live() -> Self {
        Self {
            payload: Payload::Live(null_packet_chunk()),
            ..Self::new()
        }
    }

    /// Streams `chunks` in order, then ends the stream.
    pub fn with_payload<I, C>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.payload = Payload::Fixed(
            chunks
                .into_iter()
                .map(|chunk| Bytes::copy_from_slice(chunk.as_ref()))
                .collect(),
        );
        self
    }

    /// Delays every start request.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Statistics reported for every running player.
    pub fn with_stats(mut self, stats: EngineStats) -> Self {
        self.stats = stats;
        self
    }

    /// Fails the next `count` start requests.
    pub fn fail_starts(self, count: u32) -> Self {
        self.state.lock().failing_starts = count;
        self
    }

    /// Fails the next `count` stream copies before any byte is written.
    pub fn fail_streams(self, count: u32) -> Self {
        self.state.lock().failing_streams = count;
        self
    }

    /// Fails every stats request.
    pub fn fail_stats(self) -> Self {
        self.state.lock().failing_stats = true;
        self
    }

    /// Rejects every start request for `content_id`.
    pub fn with_unplayable(self, content_id: ContentId) -> Self {
        self.state.lock().unplayable.insert(content_id);
        self
    }

    /// Makes every operation fail as if the engine were down.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }

    pub fn stream_calls(&self) -> usize {
        self.state.lock().stream_calls
    }

    pub fn stats_calls(&self) -> usize {
        self.state.lock().stats_calls
    }

    /// Players started and not yet stopped.
    pub fn active_players(&self) -> usize {
        self.state.lock().players.len()
    }

    fn offline_error() -> EngineError {
        EngineError::Unavailable {
            reason: "simulated engine offline".to_string(),
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    async fn start_stream(&self, content_id: &ContentId, pid: Pid) -> Result<String, EngineError> {
        self.state.lock().start_calls += 1;

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut state = self.state.lock();
        if state.offline {
            return Err(Self::offline_error());
        }
        if state.unplayable.contains(content_id) {
            return Err(EngineError::Rejected {
                reason: format!("no sources for {content_id}"),
            });
        }
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(EngineError::Unavailable {
                reason: "simulated start failure".to_string(),
            });
        }

        state.players.insert(pid, content_id.clone());
        debug!(%content_id, %pid, "Simulated player started");
        Ok(format!("sim://{content_id}/{pid}"))
    }

    async fn stats(&self, pid: Pid) -> Result<EngineStats, EngineError> {
        let mut state = self.state.lock();
        state.stats_calls += 1;

        if state.offline {
            return Err(Self::offline_error());
        }
        if state.failing_stats {
            return Err(EngineError::InvalidResponse {
                reason: "simulated stats failure".to_string(),
            });
        }
        if !state.players.contains_key(&pid) {
            return Err(EngineError::UnknownPid { pid });
        }
        Ok(self.stats.clone())
    }

    async fn stop_stream(&self, pid: Pid) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.stop_calls += 1;

        if state.offline {
            return Err(Self::offline_error());
        }
        match state.players.remove(&pid) {
            Some(content_id) => {
                debug!(%content_id, %pid, "Simulated player stopped");
                Ok(())
            }
            None => Err(EngineError::UnknownPid { pid }),
        }
    }

    async fn stream_content(
        &self,
        request: StreamRequest<'_>,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<u64, EngineError> {
        {
            let mut state = self.state.lock();
            state.stream_calls += 1;

            if state.offline {
                return Err(Self::offline_error());
            }
            if !state.players.contains_key(&request.pid) {
                return Err(EngineError::UnknownPid { pid: request.pid });
            }
            if state.failing_streams > 0 {
                state.failing_streams -= 1;
                return Err(EngineError::Upstream {
                    reason: "simulated upstream reset".to_string(),
                });
            }
        }

        let mut writer = TimeoutWriter::new(destination, request.write_timeout);
        let mut copied = 0u64;

        match &self.payload {
            Payload::Fixed(chunks) => {
                for chunk in chunks {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    copied += writer.write_chunk(chunk).await? as u64;
                }
                Ok(copied)
            }
            Payload::Live(chunk) => {
                let mut ticker = tokio::time::interval(LIVE_CHUNK_INTERVAL);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = ticker.tick() => {}
                    }
                    copied += writer.write_chunk(chunk).await? as u64;
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if self.state.lock().offline {
            return Err(Self::offline_error());
        }
        Ok(())
    }
}

/// One chunk of MPEG-TS null packets (PID 0x1FFF).
fn null_packet_chunk() -> Bytes {
    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[..4].copy_from_slice(&[0x47, 0x1F, 0xFF, 0x10]);
    Bytes::from(packet.repeat(TS_PACKETS_PER_CHUNK))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(id: &str) -> ContentId {
        ContentId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_start_stats_stop_lifecycle() {
        let engine = SimulatedEngine::new();
        let id = content("abc");

        let url = engine.start_stream(&id, Pid::new(5)).await.unwrap();
        assert_eq!(url, "sim://abc/5");
        assert_eq!(engine.active_players(), 1);

        let stats = engine.stats(Pid::new(5)).await.unwrap();
        assert_eq!(stats.peers, 12);

        engine.stop_stream(Pid::new(5)).await.unwrap();
        assert_eq!(engine.active_players(), 0);
        assert_eq!(
            engine.stop_stream(Pid::new(5)).await,
            Err(EngineError::UnknownPid { pid: Pid::new(5) })
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let engine = SimulatedEngine::new().fail_starts(1);
        let id = content("abc");

        assert!(engine.start_stream(&id, Pid::new(1)).await.is_err());
        assert!(engine.start_stream(&id, Pid::new(1)).await.is_ok());
        assert_eq!(engine.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_live_feed_emits_null_packets_until_cancelled() {
        let engine = SimulatedEngine::live();
        let id = content("live");
        let url = engine.start_stream(&id, Pid::new(1)).await.unwrap();
        let cancel = CancellationToken::new();

        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let request = StreamRequest {
            stream_url: &url,
            content_id: &id,
            pid: Pid::new(1),
            write_timeout: Duration::from_secs(1),
        };
        let result = engine.stream_content(request, &mut writer, &cancel).await;
        stopper.await.unwrap();
        drop(writer);

        assert_eq!(result, Err(EngineError::Cancelled));

        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut received)
            .await
            .unwrap();
        assert!(!received.is_empty());
        assert_eq!(received.len() % TS_PACKET_SIZE, 0);
        assert!(
            received
                .chunks(TS_PACKET_SIZE)
                .all(|packet| packet[0] == 0x47 && packet[1] == 0x1F && packet[2] == 0xFF)
        );
    }

    #[tokio::test]
    async fn test_offline_engine_fails_ping() {
        let engine = SimulatedEngine::new();
        assert!(engine.ping().await.is_ok());

        engine.set_offline(true);
        assert!(matches!(
            engine.ping().await,
            Err(EngineError::Unavailable { .. })
        ));
    }
}
