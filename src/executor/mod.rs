//! Request executor
//!
//! Runs one request against an ordered candidate list. Each attempt takes
//! a token from the model's rate bucket, waits briefly for a concurrency
//! slot and then calls the backend under a deadline. Failures advance to
//! the next candidate after an exponential backoff; the last failure is
//! surfaced as `ExhaustedRetries`. Successful responses are recorded in
//! metrics and written through to the cache.

mod limits;
mod record;

pub use limits::{LimitTable, ModelLimits};
pub use record::{AttemptRecord, RequestJournal, RequestRecord, RequestStatus};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Backend, Invocation};
use crate::cache::{CacheMiss, CacheStore};
use crate::error::{AttemptError, EngineError, EngineResult};
use crate::registry::{ModelRegistry, RegisteredModel};
use crate::telemetry::{export, MetricsCollector, Outcome};
use crate::types::{LlmRequest, LlmResponse};

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long an attempt waits for a concurrency slot before failing over
    pub slot_wait: Duration,
    /// Per-attempt deadline when the caller sets none
    pub default_deadline: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            slot_wait: Duration::from_millis(250),
            default_deadline: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Receiving side of a caller cancellation
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a caller cancellation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked cancel handle and signal
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves if the handle is dropped first
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-call options for the synchronous path
#[derive(Debug, Clone, Default)]
pub struct CompleteOptions {
    /// Routing rule name; `None` uses the default rule
    pub rule: Option<String>,
    /// Per-attempt deadline
    pub deadline: Option<Duration>,
    /// TTL for the cached response
    pub cache_ttl: Option<Duration>,
    /// Overrides the configured semantic similarity threshold
    pub similarity_threshold: Option<f32>,
    /// Neither read from nor write to the cache
    pub skip_cache: bool,
    pub cancel: Option<CancelSignal>,
}

impl CompleteOptions {
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

/// Result of a successful call
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub request_id: Uuid,
    pub response: LlmResponse,
    /// Model that produced the response
    pub model: String,
    pub cached: bool,
    /// Similarity of a semantic cache hit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub attempts: u32,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
}

/// Runs requests against backends with limits, failover and write-through
pub struct Executor {
    registry: Arc<ModelRegistry>,
    metrics: Arc<MetricsCollector>,
    cache: Arc<CacheStore>,
    backends: DashMap<String, Arc<Backend>>,
    limits: LimitTable,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        metrics: Arc<MetricsCollector>,
        cache: Arc<CacheStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            cache,
            backends: DashMap::new(),
            limits: LimitTable::new(),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Route calls for a registered model to `backend`
    pub fn attach_backend(&self, model_id: &str, backend: Backend) -> EngineResult<()> {
        if !self.registry.contains(model_id) {
            return Err(EngineError::ModelNotFound(model_id.to_string()));
        }
        info!(model = %model_id, backend = backend.kind(), "Attached backend");
        self.backends.insert(model_id.to_string(), Arc::new(backend));
        Ok(())
    }

    pub fn has_backend(&self, model_id: &str) -> bool {
        self.backends.contains_key(model_id)
    }

    /// Try each candidate in order until one succeeds
    ///
    /// `miss` carries the key and embedding computed by the cache lookup so
    /// the write-through does not recompute them. Every attempt, including
    /// failed ones, stays on `record`.
    #[instrument(skip_all, fields(request_id = %record.id, candidates = candidates.len()))]
    pub async fn execute(
        &self,
        record: &mut RequestRecord,
        candidates: &[String],
        options: &CompleteOptions,
        miss: Option<CacheMiss>,
    ) -> EngineResult<Completion> {
        if candidates.is_empty() {
            let rule = options.rule.clone().unwrap_or_else(|| "default".to_string());
            let err = EngineError::NoAvailableModel(rule);
            record.exhaust(&err)?;
            return Err(err);
        }

        let mut last_error: Option<AttemptError> = None;
        let mut rate_limited: Option<(String, Duration)> = None;
        let mut only_rate_limited = true;

        for (index, id) in candidates.iter().enumerate() {
            if index > 0 {
                let delay = backoff_delay(
                    self.config.backoff_base,
                    self.config.backoff_max,
                    index as u32,
                );
                self.pause(delay, options).await;
            }

            record.begin_attempt(id)?;
            let started = Instant::now();
            let result = match self.registry.get(id) {
                Some(model) => self.attempt(&model, &record.request, options).await,
                None => Err(AttemptError::Unroutable(id.clone())),
            };
            let latency = started.elapsed();

            match result {
                Ok(invocation) => {
                    return self
                        .succeed(record, id, invocation, latency, options, miss)
                        .await;
                }
                Err(err) => {
                    if counts_against_model(&err) {
                        let outcome = if err.is_timeout() {
                            Outcome::timeout(latency)
                        } else {
                            Outcome::error(latency)
                        };
                        self.metrics.record(id, outcome);
                    } else {
                        export::record_attempt(id, err.kind(), latency.as_secs_f64());
                    }

                    match &err {
                        AttemptError::RateLimited { retry_after } => {
                            let shortest = rate_limited
                                .as_ref()
                                .map_or(*retry_after, |(_, d)| (*d).min(*retry_after));
                            let model = rate_limited
                                .take()
                                .map_or_else(|| id.clone(), |(m, _)| m);
                            rate_limited = Some((model, shortest));
                        }
                        _ => only_rate_limited = false,
                    }

                    warn!(
                        model = %id,
                        attempt = index + 1,
                        error_kind = err.kind(),
                        error = %err,
                        "Attempt failed"
                    );
                    record.fail_attempt(latency.as_millis() as u64, &err)?;
                    last_error = Some(err);
                }
            }
        }

        let err = match (only_rate_limited, rate_limited, last_error) {
            (true, Some((model, retry_after)), _) => EngineError::RateLimited { model, retry_after },
            (_, _, Some(last_error)) => EngineError::ExhaustedRetries {
                attempts: record.attempt_count(),
                last_error,
            },
            (_, _, None) => EngineError::Internal(anyhow::anyhow!("no attempt was made")),
        };
        error!(
            attempts = record.attempt_count(),
            error = %err,
            "All candidates failed"
        );
        record.exhaust(&err)?;
        Err(err)
    }

    /// One attempt against one model
    ///
    /// The slot permit and in-flight guard are dropped on every exit path.
    async fn attempt(
        &self,
        model: &RegisteredModel,
        request: &LlmRequest,
        options: &CompleteOptions,
    ) -> Result<Invocation, AttemptError> {
        if options.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(AttemptError::Cancelled);
        }
        let backend = self
            .backends
            .get(&model.id)
            .map(|b| b.value().clone())
            .ok_or_else(|| AttemptError::Unroutable(model.id.clone()))?;

        let limits = self.limits.for_model(&model.id, &model.config);
        limits
            .check_rate()
            .map_err(|retry_after| AttemptError::RateLimited { retry_after })?;
        let _permit = limits
            .acquire(self.config.slot_wait)
            .await
            .ok_or(AttemptError::SlotUnavailable(self.config.slot_wait))?;
        let _in_flight = model.runtime.enter();

        let deadline = options.deadline.unwrap_or(self.config.default_deadline);
        debug!(model = %model.id, deadline_ms = deadline.as_millis() as u64, "Invoking backend");
        let call = backend.invoke(&model.config, request, deadline);

        match &options.cancel {
            Some(cancel) => tokio::select! {
                result = call => result.map_err(AttemptError::from),
                _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            },
            None => call.await.map_err(AttemptError::from),
        }
    }

    async fn succeed(
        &self,
        record: &mut RequestRecord,
        id: &str,
        invocation: Invocation,
        latency: Duration,
        options: &CompleteOptions,
        miss: Option<CacheMiss>,
    ) -> EngineResult<Completion> {
        let Invocation {
            response,
            tokens_in,
            tokens_out,
        } = invocation;
        let cost = self
            .registry
            .get(id)
            .map_or(0.0, |m| m.config.cost_for(tokens_in, tokens_out));

        self.metrics
            .record(id, Outcome::success(latency, tokens_in, tokens_out, cost));
        record.complete_attempt(latency.as_millis() as u64, tokens_in, tokens_out, cost)?;

        match miss {
            Some(miss) => {
                self.cache
                    .put_after_miss(
                        miss,
                        &record.request,
                        id,
                        &response,
                        (tokens_in, tokens_out),
                        options.cache_ttl,
                    )
                    .await
            }
            None if !options.skip_cache => {
                self.cache
                    .put(
                        &record.request,
                        id,
                        &response,
                        (tokens_in, tokens_out),
                        options.cache_ttl,
                    )
                    .await
            }
            None => {}
        }

        info!(
            model = %id,
            attempts = record.attempt_count(),
            latency_ms = latency.as_millis() as u64,
            tokens_in = tokens_in,
            tokens_out = tokens_out,
            "Request completed"
        );

        Ok(Completion {
            request_id: record.id,
            response,
            model: id.to_string(),
            cached: false,
            similarity: None,
            attempts: record.attempt_count(),
            tokens_in: record.tokens_in,
            tokens_out: record.tokens_out,
            cost: record.cost,
        })
    }

    /// Sleep between attempts, cut short by cancellation
    async fn pause(&self, delay: Duration, options: &CompleteOptions) {
        if delay.is_zero() {
            return;
        }
        match &options.cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

/// Local rejections and caller cancellation say nothing about model health
fn counts_against_model(err: &AttemptError) -> bool {
    !err.is_local() && !matches!(err, AttemptError::Cancelled)
}
