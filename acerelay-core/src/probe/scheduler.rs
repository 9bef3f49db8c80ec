//! Periodic probe cycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ProbeError, ProbeService};

/// Runs a probe cycle on a fixed interval until shut down.
pub struct ProbeScheduler {
    service: Arc<ProbeService>,
    interval: Duration,
}

impl ProbeScheduler {
    pub fn new(service: Arc<ProbeService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Spawns the scheduler loop. The first cycle starts immediately.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "Probe scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.service.probe_all_streams(&shutdown).await {
                Ok(_) => {}
                Err(ProbeError::Cancelled) => break,
                Err(error) => warn!(%error, "Probe cycle failed"),
            }
        }

        info!("Probe scheduler stopped");
    }
}
