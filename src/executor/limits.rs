//! Per-model concurrency and rate limits

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::registry::ModelConfig;

/// Concurrency slots plus an optional token bucket for one model
pub struct ModelLimits {
    slots: Arc<Semaphore>,
    concurrency_limit: u32,
    rate_limit_per_minute: Option<u32>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl ModelLimits {
    pub fn new(config: &ModelConfig) -> Self {
        let limiter = config
            .rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|per_minute| RateLimiter::direct(Quota::per_minute(per_minute)));

        Self {
            slots: Arc::new(Semaphore::new(config.concurrency_limit as usize)),
            concurrency_limit: config.concurrency_limit,
            rate_limit_per_minute: config.rate_limit_per_minute,
            limiter,
        }
    }

    /// Whether these limits were built from an equivalent config
    pub fn matches(&self, config: &ModelConfig) -> bool {
        self.concurrency_limit == config.concurrency_limit
            && self.rate_limit_per_minute == config.rate_limit_per_minute
    }

    /// Take one token from the bucket, or report how long until one frees up
    pub fn check_rate(&self) -> Result<(), Duration> {
        match &self.limiter {
            None => Ok(()),
            Some(limiter) => limiter
                .check()
                .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now())),
        }
    }

    /// Wait up to `wait` for a concurrency slot
    ///
    /// The permit releases the slot when dropped, on every exit path.
    pub async fn acquire(&self, wait: Duration) -> Option<OwnedSemaphorePermit> {
        match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Limits for every model, rebuilt lazily when a config changes
#[derive(Default)]
pub struct LimitTable {
    limits: DashMap<String, Arc<ModelLimits>>,
}

impl LimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits for `id`, built under the entry lock so concurrent callers share one set
    pub fn for_model(&self, id: &str, config: &ModelConfig) -> Arc<ModelLimits> {
        if let Some(existing) = self.limits.get(id) {
            if existing.matches(config) {
                return existing.clone();
            }
        }
        match self.limits.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().matches(config) {
                    entry.insert(build(id, config));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(build(id, config)).clone(),
        }
    }
}

fn build(id: &str, config: &ModelConfig) -> Arc<ModelLimits> {
    debug!(model = %id, concurrency = config.concurrency_limit, "Building model limits");
    Arc::new(ModelLimits::new(config))
}
