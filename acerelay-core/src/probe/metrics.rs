//! Rolling metrics and quality scoring.
//!
//! Pure functions over probe results; no I/O.

use serde::Serialize;

use super::ProbeResult;
use crate::ids::ContentId;

const UPTIME_WEIGHT: f64 = 0.50;
const SPEED_WEIGHT: f64 = 0.20;
const PEERS_WEIGHT: f64 = 0.15;
const STABILITY_WEIGHT: f64 = 0.10;
const LATENCY_WEIGHT: f64 = 0.05;

/// Startup latency at which the latency component reaches zero.
const LATENCY_CEILING_MS: f64 = 10_000.0;

/// Aggregate view of a stream's probe history.
///
/// Peer, speed and latency averages cover only probes where the stream was
/// available.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub total_probes: usize,
    pub successful_probes: usize,
    pub uptime_ratio: f64,
    pub avg_peer_count: f64,
    /// Bytes per second
    pub avg_download_speed: f64,
    /// Population standard deviation of download speed
    pub speed_std_dev: f64,
    pub avg_startup_latency_ms: f64,
    pub failure_rate: f64,
}

impl Metrics {
    /// Reduces a set of probe results.
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let total_probes = results.len();
        let successful: Vec<&ProbeResult> = results.iter().filter(|r| r.is_available()).collect();
        let successful_probes = successful.len();

        let uptime_ratio = if total_probes == 0 {
            0.0
        } else {
            successful_probes as f64 / total_probes as f64
        };

        let peers: Vec<f64> = successful.iter().map(|r| f64::from(r.peer_count())).collect();
        let speeds: Vec<f64> = successful
            .iter()
            .map(|r| r.download_speed() as f64)
            .collect();
        let latencies: Vec<f64> = successful
            .iter()
            .map(|r| r.startup_latency_ms())
            .filter(|&ms| ms > 0)
            .map(|ms| ms as f64)
            .collect();

        let avg_download_speed = mean(&speeds);

        Self {
            total_probes,
            successful_probes,
            uptime_ratio,
            avg_peer_count: mean(&peers),
            avg_download_speed,
            speed_std_dev: std_dev(&speeds, avg_download_speed),
            avg_startup_latency_ms: mean(&latencies),
            failure_rate: if total_probes == 0 {
                0.0
            } else {
                1.0 - uptime_ratio
            },
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Composite [0, 1] score of a stream relative to the best seen speed and peer count.
pub fn compute_quality_score(metrics: &Metrics, max_speed: f64, max_peers: f64) -> f64 {
    let uptime = metrics.uptime_ratio.clamp(0.0, 1.0) * UPTIME_WEIGHT;

    let speed = if max_speed > 0.0 {
        (metrics.avg_download_speed / max_speed).clamp(0.0, 1.0) * SPEED_WEIGHT
    } else {
        0.0
    };

    let peers = if max_peers > 0.0 {
        (metrics.avg_peer_count / max_peers).clamp(0.0, 1.0) * PEERS_WEIGHT
    } else {
        0.0
    };

    let stability = if metrics.avg_download_speed > 0.0 {
        (1.0 - metrics.speed_std_dev / metrics.avg_download_speed).clamp(0.0, 1.0)
            * STABILITY_WEIGHT
    } else {
        0.0
    };

    let latency_factor = if metrics.avg_startup_latency_ms > 0.0 {
        (1.0 - metrics.avg_startup_latency_ms / LATENCY_CEILING_MS).clamp(0.0, 1.0)
    } else if metrics.successful_probes > 0 {
        1.0
    } else {
        0.0
    };
    let latency = latency_factor * LATENCY_WEIGHT;

    let score = uptime + speed + peers + stability + latency;
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// A stream's score and the metrics it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamQuality {
    pub info_hash: ContentId,
    pub score: f64,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// Scores streams against each other and orders them best first.
///
/// Speed and peer ceilings are the maxima over `candidates`. Equal scores
/// are ordered by identifier.
pub fn rank_streams(candidates: Vec<(ContentId, Metrics)>) -> Vec<StreamQuality> {
    let max_speed = candidates
        .iter()
        .map(|(_, m)| m.avg_download_speed)
        .fold(0.0, f64::max);
    let max_peers = candidates
        .iter()
        .map(|(_, m)| m.avg_peer_count)
        .fold(0.0, f64::max);

    let mut ranked: Vec<StreamQuality> = candidates
        .into_iter()
        .map(|(info_hash, metrics)| StreamQuality {
            score: compute_quality_score(&metrics, max_speed, max_peers),
            info_hash,
            metrics,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.info_hash.cmp(&b.info_hash))
    });
    ranked
}
