//! Fixed time buckets of per-model statistics

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Most recent latency samples kept per bucket
pub const MAX_LATENCY_SAMPLES: usize = 2048;

/// Counters and latency samples for one model over one time bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket index: unix seconds divided by the bucket duration
    pub index: i64,
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    /// Latency samples in milliseconds, oldest first
    pub latencies_ms: VecDeque<f64>,
}

impl Bucket {
    pub fn new(index: i64) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn push_latency(&mut self, latency_ms: f64) {
        if self.latencies_ms.len() == MAX_LATENCY_SAMPLES {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    /// Failed requests (errors and timeouts) over all requests
    pub fn error_rate(&self) -> f64 {
        rate(self.errors + self.timeouts, self.requests)
    }
}

/// Aggregate of several buckets
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub latencies_ms: Vec<f64>,
    pub buckets: usize,
}

impl Aggregate {
    pub fn from_buckets<'a>(buckets: impl IntoIterator<Item = &'a Bucket>) -> Self {
        let mut agg = Aggregate::default();
        for bucket in buckets {
            agg.requests += bucket.requests;
            agg.successes += bucket.successes;
            agg.errors += bucket.errors;
            agg.timeouts += bucket.timeouts;
            agg.cache_hits += bucket.cache_hits;
            agg.tokens_in += bucket.tokens_in;
            agg.tokens_out += bucket.tokens_out;
            agg.cost += bucket.cost;
            agg.latencies_ms.extend(bucket.latencies_ms.iter().copied());
            agg.buckets += 1;
        }
        agg
    }

    pub fn error_rate(&self) -> f64 {
        rate(self.errors + self.timeouts, self.requests)
    }

    /// Share of served traffic answered from the cache
    pub fn cache_hit_rate(&self) -> f64 {
        rate(self.cache_hits, self.cache_hits + self.requests)
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.latencies_ms, p)
    }

    /// Nearest-rank percentiles for several `ps`, sorting the samples once
    pub fn percentiles<const N: usize>(&self, ps: [f64; N]) -> [Option<f64>; N] {
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        ps.map(|p| nearest_rank(&sorted, p))
    }

    /// Counters and p95 without the samples
    pub fn summary(&self) -> Summary {
        Summary {
            requests: self.requests,
            errors: self.errors,
            timeouts: self.timeouts,
            cache_hits: self.cache_hits,
            buckets: self.buckets,
            p95_ms: self.percentile(95.0),
        }
    }
}

/// What scoring needs from a window: counters and its p95 latency
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub requests: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub buckets: usize,
    pub p95_ms: Option<f64>,
}

impl Summary {
    pub fn error_rate(&self) -> f64 {
        rate(self.errors + self.timeouts, self.requests)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        rate(self.cache_hits, self.cache_hits + self.requests)
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Nearest-rank percentile; `None` without samples
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    nearest_rank(&sorted, p)
}

fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}
