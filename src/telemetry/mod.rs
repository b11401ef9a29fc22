//! Metrics collector
//!
//! Rolling per-model statistics, health scoring, anomaly flags and the
//! Prometheus export.

mod collector;
pub mod export;
mod score;
mod window;

pub use collector::{
    CacheCounters, MetricsCollector, MetricsSnapshot, ModelStats, Outcome, OutcomeKind,
    TelemetryConfig,
};
pub use score::{AnomalyKind, HealthBreakdown, ScoreConfig};
pub use window::{percentile, Bucket, MAX_LATENCY_SAMPLES};
