//! Health score and anomaly rules
//!
//! Pure functions over a current window and a trailing baseline, so the
//! scoring can be checked without a clock.

use serde::{Deserialize, Serialize};

use super::window::Summary;

const ERROR_PENALTY: f64 = 40.0;
const LATENCY_PENALTY: f64 = 30.0;
const CACHE_PENALTY: f64 = 10.0;
const ANOMALY_PENALTY_EACH: f64 = 10.0;
const ANOMALY_PENALTY_MAX: f64 = 20.0;

/// Error rate at which the error penalty is maxed out
const ERROR_RATE_CEILING: f64 = 0.5;
/// Lowest error rate that can count as a spike
const ERROR_RATE_FLOOR: f64 = 0.05;

/// Kind of anomaly flagged for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ErrorSpike,
    LatencySpike,
    VolumeSpike,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 3] = [
        AnomalyKind::ErrorSpike,
        AnomalyKind::LatencySpike,
        AnomalyKind::VolumeSpike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::ErrorSpike => "error_spike",
            AnomalyKind::LatencySpike => "latency_spike",
            AnomalyKind::VolumeSpike => "volume_spike",
        }
    }
}

/// Tunables for scoring and anomaly detection
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    /// Cache hit rate below which the cache penalty applies; 0 disables it
    pub cache_hit_target: f64,
    /// Multiple of the baseline error rate that counts as a spike
    pub error_spike_factor: f64,
    /// Multiple of the baseline p95 that counts as a spike
    pub latency_spike_factor: f64,
    /// Multiple of the average baseline volume that counts as a spike
    pub volume_spike_factor: f64,
    /// Requests needed in the current window before flagging anything
    pub min_samples: u64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            cache_hit_target: 0.3,
            error_spike_factor: 3.0,
            latency_spike_factor: 2.0,
            volume_spike_factor: 3.0,
            min_samples: 20,
        }
    }
}

/// Breakdown of a health score
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HealthBreakdown {
    pub score: f64,
    pub error_penalty: f64,
    pub latency_penalty: f64,
    pub cache_penalty: f64,
    pub anomaly_penalty: f64,
}

/// Anomaly conditions that hold right now
pub fn detect(config: &ScoreConfig, current: &Summary, baseline: &Summary) -> Vec<AnomalyKind> {
    let mut found = Vec::new();
    if current.requests < config.min_samples {
        return found;
    }

    let error_threshold = (baseline.error_rate() * config.error_spike_factor).max(ERROR_RATE_FLOOR);
    if current.error_rate() > error_threshold {
        found.push(AnomalyKind::ErrorSpike);
    }

    if let (Some(now), Some(base)) = (current.p95_ms, baseline.p95_ms) {
        if base > 0.0 && now > base * config.latency_spike_factor {
            found.push(AnomalyKind::LatencySpike);
        }
    }

    if baseline.buckets > 0 {
        let average = baseline.requests as f64 / baseline.buckets as f64;
        if current.requests as f64 > average * config.volume_spike_factor {
            found.push(AnomalyKind::VolumeSpike);
        }
    }

    found
}

/// Weighted deduction from 100, floored at 0
pub fn health(
    config: &ScoreConfig,
    current: &Summary,
    baseline: &Summary,
    active_anomalies: usize,
) -> HealthBreakdown {
    let error_penalty =
        ERROR_PENALTY * (current.error_rate() / ERROR_RATE_CEILING).clamp(0.0, 1.0);

    let latency_penalty = match (current.p95_ms, baseline.p95_ms) {
        (Some(now), Some(base)) if base > 0.0 => {
            LATENCY_PENALTY * (now / base - 1.0).clamp(0.0, 1.0)
        }
        _ => 0.0,
    };

    let served = current.requests + current.cache_hits;
    let cache_penalty = if config.cache_hit_target > 0.0 && served > 0 {
        let shortfall = (config.cache_hit_target - current.cache_hit_rate()).max(0.0);
        CACHE_PENALTY * (shortfall / config.cache_hit_target).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let anomaly_penalty = (active_anomalies as f64 * ANOMALY_PENALTY_EACH).min(ANOMALY_PENALTY_MAX);

    let score = (100.0 - error_penalty - latency_penalty - cache_penalty - anomaly_penalty).max(0.0);
    HealthBreakdown {
        score,
        error_penalty,
        latency_penalty,
        cache_penalty,
        anomaly_penalty,
    }
}
