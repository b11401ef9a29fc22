//! Rolling per-model statistics and health scoring
//!
//! The collector is a sink for executor and cache outcomes and a source
//! for load balancer reads. After every update it recomputes the model's
//! health from the current window and publishes score, window counters
//! and status into the registry's runtime state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::{ModelRegistry, ModelStatus, WindowCounters};

use super::export;
use super::score::{self, AnomalyKind, HealthBreakdown, ScoreConfig};
use super::window::{Aggregate, Bucket, Summary};

/// Configuration for the metrics collector
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Length of one statistics bucket (default: 1 hour)
    pub bucket: Duration,
    /// Buckets kept per model, the current one included (default: 24)
    pub retention_buckets: usize,
    pub score: ScoreConfig,
    /// Health below which a model is marked degraded
    pub degrade_below: Option<f64>,
    /// Health below which a model is suspended
    pub suspend_below: Option<f64>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(3600),
            retention_buckets: 24,
            score: ScoreConfig::default(),
            degrade_below: Some(60.0),
            suspend_below: Some(20.0),
        }
    }
}

/// Result class of one backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Error,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Error => "error",
            OutcomeKind::Timeout => "timeout",
        }
    }
}

/// One backend call as seen by the collector
#[derive(Debug, Clone)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub latency: Duration,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
}

impl Outcome {
    pub fn success(latency: Duration, tokens_in: u32, tokens_out: u32, cost: f64) -> Self {
        Self {
            kind: OutcomeKind::Success,
            latency,
            tokens_in,
            tokens_out,
            cost,
        }
    }

    pub fn error(latency: Duration) -> Self {
        Self {
            kind: OutcomeKind::Error,
            latency,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
        }
    }

    pub fn timeout(latency: Duration) -> Self {
        Self {
            kind: OutcomeKind::Timeout,
            ..Self::error(latency)
        }
    }
}

/// Global cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Aggregated statistics of one model over a window
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub window_secs: u64,
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub health: f64,
    pub status: Option<ModelStatus>,
    pub anomalies: Vec<AnomalyKind>,
}

/// Serialized form of every retained bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub bucket_secs: u64,
    pub models: BTreeMap<String, Vec<Bucket>>,
}

#[derive(Debug, Default)]
struct ModelSeries {
    buckets: BTreeMap<i64, Bucket>,
    /// Last time each anomaly condition held
    anomalies: HashMap<AnomalyKind, DateTime<Utc>>,
    /// Summary of every bucket before the keyed index
    baseline: Option<(i64, Summary)>,
    /// p95 used for latency routing, refreshed on every evaluation
    routing_p95: Option<f64>,
}

struct Evaluation {
    breakdown: HealthBreakdown,
    anomalies: Vec<AnomalyKind>,
    window: WindowCounters,
}

impl ModelSeries {
    fn bucket_mut(&mut self, index: i64) -> &mut Bucket {
        self.touch(index);
        self.buckets
            .entry(index)
            .or_insert_with(|| Bucket::new(index))
    }

    fn insert_bucket(&mut self, bucket: Bucket) -> bool {
        if self.buckets.contains_key(&bucket.index) {
            return false;
        }
        self.touch(bucket.index);
        self.buckets.insert(bucket.index, bucket);
        true
    }

    /// Drop the cached baseline if it covers bucket `index`
    fn touch(&mut self, index: i64) {
        if self.baseline.is_some_and(|(upto, _)| index < upto) {
            self.baseline = None;
        }
    }

    fn prune(&mut self, current: i64, retention: usize) {
        let oldest = current - retention.max(1) as i64 + 1;
        let before = self.buckets.len();
        self.buckets.retain(|index, _| *index >= oldest);
        if self.buckets.len() != before {
            self.baseline = None;
        }
    }

    fn current(&self, index: i64) -> Summary {
        Aggregate::from_buckets(self.buckets.get(&index)).summary()
    }

    fn baseline(&mut self, index: i64) -> Summary {
        match self.baseline {
            Some((upto, summary)) if upto == index => summary,
            _ => {
                let summary =
                    Aggregate::from_buckets(self.buckets.range(..index).map(|(_, b)| b)).summary();
                self.baseline = Some((index, summary));
                summary
            }
        }
    }

    fn evaluate(&mut self, config: &TelemetryConfig, index: i64, at: DateTime<Utc>) -> Evaluation {
        let current = self.current(index);
        let baseline = self.baseline(index);
        self.routing_p95 = current.p95_ms.or(baseline.p95_ms);

        for kind in score::detect(&config.score, &current, &baseline) {
            self.anomalies.insert(kind, at);
        }
        let hold = chrono::Duration::from_std(config.bucket).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.anomalies.retain(|_, seen| at.signed_duration_since(*seen) < hold);

        let mut anomalies: Vec<AnomalyKind> = self.anomalies.keys().copied().collect();
        anomalies.sort();

        let breakdown = score::health(&config.score, &current, &baseline, anomalies.len());
        Evaluation {
            breakdown,
            anomalies,
            window: WindowCounters {
                requests: current.requests,
                errors: current.errors,
                timeouts: current.timeouts,
            },
        }
    }
}

/// Metrics collector
pub struct MetricsCollector {
    registry: Arc<ModelRegistry>,
    config: TelemetryConfig,
    series: DashMap<String, Arc<Mutex<ModelSeries>>>,
    cache_hits: AtomicU64,
    cache_semantic_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
}

impl MetricsCollector {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_config(registry, TelemetryConfig::default())
    }

    pub fn with_config(registry: Arc<ModelRegistry>, config: TelemetryConfig) -> Self {
        Self {
            registry,
            config,
            series: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_semantic_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    fn bucket_index(&self, at: DateTime<Utc>) -> i64 {
        let secs = self.config.bucket.as_secs().max(1) as i64;
        at.timestamp().div_euclid(secs)
    }

    fn series(&self, model: &str) -> Arc<Mutex<ModelSeries>> {
        if let Some(series) = self.series.get(model) {
            return series.clone();
        }
        self.series.entry(model.to_string()).or_default().clone()
    }

    /// Record a backend call outcome for a model
    pub fn record(&self, model: &str, outcome: Outcome) {
        self.record_at(model, outcome, Utc::now());
    }

    /// Record an outcome as if it happened at `at`
    pub fn record_at(&self, model: &str, outcome: Outcome, at: DateTime<Utc>) {
        let index = self.bucket_index(at);
        let series = self.series(model);
        let evaluation = {
            let mut series = series.lock();
            let bucket = series.bucket_mut(index);
            bucket.requests += 1;
            match outcome.kind {
                OutcomeKind::Success => bucket.successes += 1,
                OutcomeKind::Error => bucket.errors += 1,
                OutcomeKind::Timeout => bucket.timeouts += 1,
            }
            bucket.push_latency(outcome.latency.as_secs_f64() * 1000.0);
            bucket.tokens_in += outcome.tokens_in as u64;
            bucket.tokens_out += outcome.tokens_out as u64;
            bucket.cost += outcome.cost;
            series.prune(index, self.config.retention_buckets);
            series.evaluate(&self.config, index, at)
        };

        export::record_attempt(model, outcome.kind.as_str(), outcome.latency.as_secs_f64());
        if outcome.tokens_in > 0 {
            export::record_tokens("input", outcome.tokens_in as u64, model);
        }
        if outcome.tokens_out > 0 {
            export::record_tokens("output", outcome.tokens_out as u64, model);
        }

        self.publish(model, &evaluation);
    }

    /// Record a cache hit served from an entry produced by `model`
    pub fn record_cache_hit(&self, model: &str, semantic: bool) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        if semantic {
            self.cache_semantic_hits.fetch_add(1, Ordering::Relaxed);
        }
        export::record_cache_operation("get", if semantic { "semantic_hit" } else { "hit" });

        let at = Utc::now();
        let index = self.bucket_index(at);
        let series = self.series(model);
        let evaluation = {
            let mut series = series.lock();
            series.bucket_mut(index).cache_hits += 1;
            series.evaluate(&self.config, index, at)
        };
        self.publish(model, &evaluation);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        export::record_cache_operation("get", "miss");
    }

    pub fn record_cache_eviction(&self, reason: &str) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
        export::record_cache_operation("evict", reason);
    }

    pub fn cache_counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.cache_hits.load(Ordering::Relaxed),
            semantic_hits: self.cache_semantic_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.cache_evictions.load(Ordering::Relaxed),
        }
    }

    /// Current health score of a model; 100 for a model without data
    pub fn health_score(&self, model: &str) -> f64 {
        self.health_breakdown_at(model, Utc::now()).score
    }

    pub fn health_score_at(&self, model: &str, at: DateTime<Utc>) -> f64 {
        self.health_breakdown_at(model, at).score
    }

    pub fn health_breakdown_at(&self, model: &str, at: DateTime<Utc>) -> HealthBreakdown {
        self.evaluate(model, at)
            .map(|e| e.breakdown)
            .unwrap_or(HealthBreakdown {
                score: 100.0,
                ..Default::default()
            })
    }

    /// Active anomaly flags of a model
    pub fn detect_anomalies(&self, model: &str) -> Vec<AnomalyKind> {
        self.detect_anomalies_at(model, Utc::now())
    }

    pub fn detect_anomalies_at(&self, model: &str, at: DateTime<Utc>) -> Vec<AnomalyKind> {
        self.evaluate(model, at)
            .map(|e| e.anomalies)
            .unwrap_or_default()
    }

    fn evaluate(&self, model: &str, at: DateTime<Utc>) -> Option<Evaluation> {
        let series = self.series.get(model)?.clone();
        let index = self.bucket_index(at);
        let mut series = series.lock();
        Some(series.evaluate(&self.config, index, at))
    }

    /// p95 latency in milliseconds as of the model's last evaluation
    ///
    /// The current bucket's p95, or the trailing baseline's while the
    /// current bucket has no samples. Idle models are re-evaluated by
    /// `refresh_all`.
    pub fn p95_latency(&self, model: &str) -> Option<f64> {
        let series = self.series.get(model)?.clone();
        let p95 = series.lock().routing_p95;
        p95
    }

    /// Statistics of a model aggregated over the buckets touching `window`
    pub fn stats(&self, model: &str, window: Duration) -> ModelStats {
        let now = Utc::now();
        let from = now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let (first, last) = (self.bucket_index(from), self.bucket_index(now));

        let aggregate = self
            .series
            .get(model)
            .map(|s| s.clone())
            .map(|series| {
                let series = series.lock();
                Aggregate::from_buckets(series.buckets.range(first..=last).map(|(_, b)| b))
            })
            .unwrap_or_default();

        let [p50_ms, p95_ms, p99_ms] = aggregate.percentiles([50.0, 95.0, 99.0]);
        let registered = self.registry.get(model);
        let evaluation = self.evaluate(model, now);

        ModelStats {
            model: model.to_string(),
            window_secs: window.as_secs(),
            requests: aggregate.requests,
            successes: aggregate.successes,
            errors: aggregate.errors,
            timeouts: aggregate.timeouts,
            cache_hits: aggregate.cache_hits,
            error_rate: aggregate.error_rate(),
            cache_hit_rate: aggregate.cache_hit_rate(),
            p50_ms,
            p95_ms,
            p99_ms,
            tokens_in: aggregate.tokens_in,
            tokens_out: aggregate.tokens_out,
            cost: aggregate.cost,
            health: evaluation
                .as_ref()
                .map(|e| e.breakdown.score)
                .unwrap_or(100.0),
            status: registered.map(|m| m.status()),
            anomalies: evaluation.map(|e| e.anomalies).unwrap_or_default(),
        }
    }

    /// Published health score of every registered model
    pub fn health_map(&self) -> BTreeMap<String, f64> {
        self.registry
            .list(&Default::default())
            .into_iter()
            .map(|m| {
                let score = m.health();
                (m.id, score)
            })
            .collect()
    }

    /// Recompute every registered model from its current window
    ///
    /// Lets idle models recover once their bad bucket ages out.
    pub fn refresh_all(&self) {
        self.refresh_all_at(Utc::now());
    }

    pub fn refresh_all_at(&self, at: DateTime<Utc>) {
        let index = self.bucket_index(at);
        for id in self.registry.ids() {
            let series = self.series(&id);
            let evaluation = {
                let mut series = series.lock();
                series.prune(index, self.config.retention_buckets);
                series.evaluate(&self.config, index, at)
            };
            self.publish(&id, &evaluation);
        }
        debug!(models = self.registry.len(), "Refreshed model health");
    }

    fn publish(&self, id: &str, evaluation: &Evaluation) {
        let Some(model) = self.registry.get(id) else {
            return;
        };
        let score = evaluation.breakdown.score;
        model.runtime.set_health(score);
        model.runtime.publish_window(evaluation.window);
        export::set_model_health(id, score);

        let desired = self.status_for(score);
        if model.status() != desired {
            if !evaluation.anomalies.is_empty() {
                warn!(
                    model = %id,
                    anomalies = ?evaluation.anomalies,
                    health = score,
                    "Anomalies active"
                );
            }
            if let Err(e) = self.registry.update_status(id, desired) {
                warn!(model = %id, error = %e, "Failed to update model status");
            }
        }
    }

    fn status_for(&self, score: f64) -> ModelStatus {
        if self.config.suspend_below.is_some_and(|t| score < t) {
            ModelStatus::Suspended
        } else if self.config.degrade_below.is_some_and(|t| score < t) {
            ModelStatus::Degraded
        } else {
            ModelStatus::Active
        }
    }

    /// Copy of every retained bucket
    pub fn snapshot(&self) -> MetricsSnapshot {
        let models = self
            .series
            .iter()
            .map(|entry| {
                let series = entry.value().lock();
                (entry.key().clone(), series.buckets.values().cloned().collect())
            })
            .collect();
        MetricsSnapshot {
            taken_at: Utc::now(),
            bucket_secs: self.config.bucket.as_secs(),
            models,
        }
    }

    /// Merge buckets from a snapshot; returns how many were restored
    ///
    /// Buckets already present are kept. A snapshot taken with a different
    /// bucket length is ignored.
    pub fn restore(&self, snapshot: MetricsSnapshot) -> usize {
        if snapshot.bucket_secs != self.config.bucket.as_secs() {
            warn!(
                snapshot_bucket_secs = snapshot.bucket_secs,
                bucket_secs = self.config.bucket.as_secs(),
                "Ignoring metrics snapshot with a different bucket length"
            );
            return 0;
        }

        let mut restored = 0;
        for (model, buckets) in snapshot.models {
            let series = self.series(&model);
            let mut series = series.lock();
            for bucket in buckets {
                if series.insert_bucket(bucket) {
                    restored += 1;
                }
            }
        }
        info!(buckets = restored, "Restored metrics snapshot");
        self.refresh_all();
        restored
    }
}
