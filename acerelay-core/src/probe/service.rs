//! Health probing against the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Metrics, ProbeError, ProbeResult, ProbeStorage, StreamCatalog, StreamQuality, rank_streams,
};
use crate::config::ProbeConfig;
use crate::engine::Engine;
use crate::ids::{self, ContentId, Pid};

/// Outcome counts for one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeCycleSummary {
    pub probed: usize,
    pub available: usize,
    pub unavailable: usize,
    /// Probes that produced no stored result
    pub failed: usize,
    /// Results removed by the cleanup that ends the cycle
    pub cleaned_up: usize,
}

/// Probes streams, records results and serves rolling metrics.
pub struct ProbeService {
    engine: Arc<dyn Engine>,
    storage: Arc<dyn ProbeStorage>,
    catalog: Arc<dyn StreamCatalog>,
    config: ProbeConfig,
}

impl ProbeService {
    pub fn new(
        engine: Arc<dyn Engine>,
        storage: Arc<dyn ProbeStorage>,
        catalog: Arc<dyn StreamCatalog>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            engine,
            storage,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probes every known stream once, one after another.
    ///
    /// Individual probe failures are logged and do not stop the cycle.
    /// Cleanup runs once the cycle completes.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Cancelled` - `cancel` fired; remaining streams are skipped
    /// - `ProbeError::Catalog` - The stream list could not be loaded
    pub async fn probe_all_streams(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProbeCycleSummary, ProbeError> {
        let streams = self.catalog.all_streams().await?;
        let mut summary = ProbeCycleSummary::default();

        info!(streams = streams.len(), "Starting probe cycle");
        for info_hash in &streams {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }

            summary.probed += 1;
            match self.probe_stream(cancel, info_hash).await {
                Ok(result) if result.is_available() => summary.available += 1,
                Ok(_) => summary.unavailable += 1,
                Err(ProbeError::Cancelled) => return Err(ProbeError::Cancelled),
                Err(error) => {
                    warn!(%info_hash, %error, "Probe failed");
                    summary.failed += 1;
                }
            }
        }

        match self.cleanup().await {
            Ok(deleted) => summary.cleaned_up = deleted,
            Err(error) => warn!(%error, "Probe cleanup failed"),
        }

        info!(
            probed = summary.probed,
            available = summary.available,
            unavailable = summary.unavailable,
            failed = summary.failed,
            cleaned_up = summary.cleaned_up,
            "Probe cycle finished"
        );
        Ok(summary)
    }

    /// Probes one stream under its own PID and stores the result.
    ///
    /// Engine failures become unavailable or partial results rather than
    /// errors.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Cancelled` - `cancel` fired
    /// - `ProbeError::Storage` - The result could not be saved
    pub async fn probe_stream(
        &self,
        cancel: &CancellationToken,
        info_hash: &ContentId,
    ) -> Result<ProbeResult, ProbeError> {
        let pid = ids::next_pid();
        let timestamp = Utc::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(
                self.config.probe_timeout,
                self.run_probe(info_hash, pid, timestamp),
            ) => Some(outcome),
        };

        let result = match outcome {
            None => {
                self.abandon_player(info_hash, pid).await;
                return Err(ProbeError::Cancelled);
            }
            Some(Err(_)) => {
                self.abandon_player(info_hash, pid).await;
                ProbeResult::unavailable(
                    info_hash.clone(),
                    timestamp,
                    format!("probe timed out after {:?}", self.config.probe_timeout),
                )?
            }
            Some(Ok(result)) => result?,
        };

        self.storage.save(&result).await?;
        debug!(
            %info_hash,
            %pid,
            available = result.is_available(),
            peers = result.peer_count(),
            "Probe recorded"
        );
        Ok(result)
    }

    async fn run_probe(
        &self,
        info_hash: &ContentId,
        pid: Pid,
        timestamp: DateTime<Utc>,
    ) -> Result<ProbeResult, ProbeError> {
        let started = Instant::now();

        if let Err(error) = self.engine.start_stream(info_hash, pid).await {
            debug!(%info_hash, %pid, %error, "Probe start failed");
            return ProbeResult::unavailable(info_hash.clone(), timestamp, error.to_string());
        }
        let startup_latency = started.elapsed();

        if !self.config.stats_delay.is_zero() {
            tokio::time::sleep(self.config.stats_delay).await;
        }
        let stats = self.engine.stats(pid).await;

        if let Err(error) = self.engine.stop_stream(pid).await {
            warn!(%info_hash, %pid, %error, "Failed to stop probe player");
        }

        match stats {
            Ok(stats) => ProbeResult::available(info_hash.clone(), timestamp, startup_latency, &stats),
            Err(error) => ProbeResult::partial(
                info_hash.clone(),
                timestamp,
                startup_latency,
                format!("stats unavailable: {error}"),
            ),
        }
    }

    /// Best-effort stop for a probe cut short before it stopped its player.
    async fn abandon_player(&self, info_hash: &ContentId, pid: Pid) {
        if let Err(error) = self.engine.stop_stream(pid).await {
            debug!(%info_hash, %pid, %error, "No probe player to stop");
        }
    }

    /// Aggregates the stream's results inside the rolling window.
    ///
    /// # Errors
    ///
    /// - `ProbeError::NoData` - No results inside the window
    /// - `ProbeError::Storage` - Results could not be loaded
    pub async fn get_metrics(&self, info_hash: &ContentId) -> Result<Metrics, ProbeError> {
        let since = window_start(Utc::now(), self.config.rolling_window);
        let results = self
            .storage
            .find_by_info_hash_since(info_hash, since)
            .await?;

        if results.is_empty() {
            return Err(ProbeError::NoData {
                info_hash: info_hash.clone(),
            });
        }
        Ok(Metrics::from_results(&results))
    }

    /// Ranks a channel's streams, best first.
    ///
    /// Streams without probe data in the window are left out.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Catalog` - Unknown channel
    /// - `ProbeError::Storage` - Results could not be loaded
    pub async fn get_quality_scores(&self, channel: &str) -> Result<Vec<StreamQuality>, ProbeError> {
        let streams = self.catalog.streams_for_channel(channel).await?;

        let mut candidates = Vec::with_capacity(streams.len());
        for info_hash in streams {
            match self.get_metrics(&info_hash).await {
                Ok(metrics) => candidates.push((info_hash, metrics)),
                Err(ProbeError::NoData { .. }) => {}
                Err(error) => return Err(error),
            }
        }

        Ok(rank_streams(candidates))
    }

    /// Stored results for a stream, newest first.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Storage` - Results could not be loaded
    pub async fn recent_probes(&self, info_hash: &ContentId) -> Result<Vec<ProbeResult>, ProbeError> {
        let since = window_start(Utc::now(), self.config.retention());
        let mut results = self
            .storage
            .find_by_info_hash_since(info_hash, since)
            .await?;
        results.reverse();
        Ok(results)
    }

    /// Deletes results older than twice the rolling window.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Storage` - The delete failed
    pub async fn cleanup(&self) -> Result<usize, ProbeError> {
        let cutoff = window_start(Utc::now(), self.config.retention());
        let deleted = self.storage.delete_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "Removed expired probe results");
        }
        Ok(deleted)
    }
}

fn window_start(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::engine::{EngineStats, SimulatedEngine};
    use crate::probe::{InMemoryProbeStorage, StaticCatalog};

    struct Fixture {
        engine: Arc<SimulatedEngine>,
        storage: Arc<InMemoryProbeStorage>,
        service: ProbeService,
    }

    fn id(raw: &str) -> ContentId {
        ContentId::parse(raw).unwrap()
    }

    fn fixture(engine: SimulatedEngine) -> Fixture {
        let engine = Arc::new(engine);
        let storage = Arc::new(InMemoryProbeStorage::new());
        let catalog = StaticCatalog::new()
            .with_channel("news", [id("good"), id("bad")])
            .with_channel("sports", [id("good")]);

        let service = ProbeService::new(
            Arc::clone(&engine) as Arc<dyn Engine>,
            Arc::clone(&storage) as Arc<dyn ProbeStorage>,
            Arc::new(catalog),
            RelayConfig::for_testing().probe,
        );
        Fixture {
            engine,
            storage,
            service,
        }
    }

    #[tokio::test]
    async fn test_probe_records_stats_and_stops_player() {
        let fx = fixture(SimulatedEngine::new().with_stats(EngineStats {
            peers: 30,
            speed_down: 400_000,
            status: "dl".to_string(),
        }));
        let cancel = CancellationToken::new();

        let result = fx.service.probe_stream(&cancel, &id("good")).await.unwrap();

        assert!(result.is_available());
        assert_eq!(result.peer_count(), 30);
        assert_eq!(result.download_speed(), 400_000);
        assert_eq!(fx.engine.stats_calls(), 1);
        assert_eq!(fx.engine.stop_calls(), 1);
        assert_eq!(fx.engine.active_players(), 0);
        assert_eq!(fx.storage.len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_records_unavailable_result() {
        let fx = fixture(SimulatedEngine::new().with_unplayable(id("bad")));
        let cancel = CancellationToken::new();

        let result = fx.service.probe_stream(&cancel, &id("bad")).await.unwrap();

        assert!(!result.is_available());
        assert!(result.error_message().unwrap().contains("no sources"));
        assert_eq!(fx.engine.stats_calls(), 0);
        assert_eq!(fx.storage.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_failure_records_partial_result() {
        let fx = fixture(SimulatedEngine::new().fail_stats());
        let cancel = CancellationToken::new();

        let result = fx.service.probe_stream(&cancel, &id("good")).await.unwrap();

        assert!(result.is_available());
        assert_eq!(result.peer_count(), 0);
        assert!(result.error_message().is_some());
        assert_eq!(fx.engine.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_slow_engine_records_timeout() {
        let fx = fixture(SimulatedEngine::new().with_start_delay(Duration::from_secs(5)));
        let cancel = CancellationToken::new();

        let result = fx.service.probe_stream(&cancel, &id("good")).await.unwrap();

        assert!(!result.is_available());
        assert!(result.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cycle_continues_past_failures() {
        let fx = fixture(SimulatedEngine::new().with_unplayable(id("bad")));
        let cancel = CancellationToken::new();

        let summary = fx.service.probe_all_streams(&cancel).await.unwrap();

        assert_eq!(summary.probed, 2);
        assert_eq!(summary.available, 1);
        assert_eq!(summary.unavailable, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_returns_cancellation() {
        let fx = fixture(SimulatedEngine::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fx.service.probe_all_streams(&cancel).await;

        assert!(matches!(result, Err(ProbeError::Cancelled)));
        assert!(fx.storage.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_require_data() {
        let fx = fixture(SimulatedEngine::new());

        let result = fx.service.get_metrics(&id("good")).await;

        assert!(matches!(result, Err(ProbeError::NoData { .. })));
    }

    #[tokio::test]
    async fn test_quality_scores_rank_channel_streams() {
        let fx = fixture(SimulatedEngine::new().with_unplayable(id("bad")));
        let cancel = CancellationToken::new();
        fx.service.probe_all_streams(&cancel).await.unwrap();

        let ranked = fx.service.get_quality_scores("news").await.unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].info_hash, id("good"));
        assert_eq!(ranked[1].score, 0.0);
        assert!(matches!(
            fx.service.get_quality_scores("movies").await,
            Err(ProbeError::Catalog(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_probes_are_newest_first() {
        let fx = fixture(SimulatedEngine::new());
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            fx.service.probe_stream(&cancel, &id("good")).await.unwrap();
        }

        let recent = fx.service.recent_probes(&id("good")).await.unwrap();

        assert_eq!(recent.len(), 3);
        assert!(
            recent
                .windows(2)
                .all(|pair| pair[0].timestamp() >= pair[1].timestamp())
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_results_past_retention() {
        let fx = fixture(SimulatedEngine::new());
        let expired = Utc::now() - TimeDelta::hours(49);
        let old = ProbeResult::unavailable(id("good"), expired, "down").unwrap();
        fx.storage.save(&old).await.unwrap();
        fx.service
            .probe_stream(&CancellationToken::new(), &id("good"))
            .await
            .unwrap();

        assert_eq!(fx.service.cleanup().await.unwrap(), 1);
        assert_eq!(fx.storage.len(), 1);
    }
}
