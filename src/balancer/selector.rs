//! Candidate selection
//!
//! Filters the rule's pool by status, health, capability and context size,
//! then orders what is left by the rule's strategy. The full ordered list
//! is returned so the executor can fail over along it.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::distr::weighted::WeightedIndex;
use rand::prelude::*;
use tracing::{debug, warn};

use super::rule::{LoadBalancingRule, Strategy};
use crate::registry::{Capability, ModelFilter, ModelRegistry, ModelStatus, RegisteredModel};
use crate::telemetry::MetricsCollector;
use crate::tokens;
use crate::types::LlmRequest;

/// Orders candidate models for a request under a rule
pub struct LoadBalancer {
    registry: Arc<ModelRegistry>,
    metrics: Arc<MetricsCollector>,
    /// Round-robin cursor per rule
    cursors: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ModelRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            registry,
            metrics,
            cursors: DashMap::new(),
        }
    }

    /// Ordered model ids to try; empty when nothing is eligible
    pub fn select_candidates(&self, request: &LlmRequest, rule: &LoadBalancingRule) -> Vec<String> {
        self.select_candidates_with_rng(request, rule, &mut rand::rng())
    }

    pub fn select_candidates_with_rng<R: Rng + ?Sized>(
        &self,
        request: &LlmRequest,
        rule: &LoadBalancingRule,
        rng: &mut R,
    ) -> Vec<String> {
        let capability = Capability::required_for(request.kind);
        let prompt_tokens = tokens::count_request_tokens(request) as u64;
        let context_needed = prompt_tokens + request.max_tokens.unwrap_or(0) as u64;

        let eligible: Vec<RegisteredModel> = self
            .pool(rule)
            .into_iter()
            .filter(|m| m.status() != ModelStatus::Suspended)
            .filter(|m| m.health() >= rule.min_health)
            .filter(|m| m.config.supports(capability))
            .filter(|m| context_needed <= m.config.max_context_tokens as u64)
            .collect();

        if eligible.is_empty() {
            return self.fallback(rule, capability);
        }

        let ordered = match rule.strategy {
            Strategy::RoundRobin => self.round_robin(rule, eligible),
            Strategy::Weighted => weighted(rule, eligible, rng),
            Strategy::LeastLatency => self.least_latency(eligible),
            Strategy::CostOptimized => cost_optimized(request, prompt_tokens as u32, eligible),
            Strategy::Priority => priority(eligible),
        };

        let ids: Vec<String> = ordered.into_iter().map(|m| m.id).collect();
        debug!(
            rule = %rule.name,
            strategy = %rule.strategy,
            candidates = ?ids,
            "Selected candidates"
        );
        ids
    }

    fn pool(&self, rule: &LoadBalancingRule) -> Vec<RegisteredModel> {
        if rule.pool.is_empty() {
            return self.registry.list(&ModelFilter::default());
        }
        rule.pool
            .iter()
            .filter_map(|id| {
                let model = self.registry.get(id);
                if model.is_none() {
                    debug!(rule = %rule.name, model = %id, "Pool references unregistered model");
                }
                model
            })
            .collect()
    }

    fn fallback(&self, rule: &LoadBalancingRule, capability: Capability) -> Vec<String> {
        let Some(fallback) = &rule.fallback_model else {
            return Vec::new();
        };
        match self.registry.get(fallback) {
            Some(model)
                if model.status() != ModelStatus::Suspended && model.config.supports(capability) =>
            {
                warn!(rule = %rule.name, fallback = %fallback, "Eligible pool empty, using fallback model");
                vec![model.id]
            }
            _ => {
                warn!(rule = %rule.name, fallback = %fallback, "Fallback model is not usable");
                Vec::new()
            }
        }
    }

    fn round_robin(&self, rule: &LoadBalancingRule, mut eligible: Vec<RegisteredModel>) -> Vec<RegisteredModel> {
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        let turn = self
            .cursors
            .entry(rule.name.clone())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        let len = eligible.len();
        eligible.rotate_left(turn % len);
        eligible
    }

    /// Ascending rolling p95; models without samples count as the average
    fn least_latency(&self, eligible: Vec<RegisteredModel>) -> Vec<RegisteredModel> {
        let latencies: Vec<Option<f64>> = eligible
            .iter()
            .map(|m| self.metrics.p95_latency(&m.id))
            .collect();
        let known: Vec<f64> = latencies.iter().flatten().copied().collect();
        let average = if known.is_empty() {
            0.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        let mut keyed: Vec<(f64, RegisteredModel)> = latencies
            .into_iter()
            .map(|l| l.unwrap_or(average))
            .zip(eligible)
            .collect();
        keyed.sort_by(|(la, a), (lb, b)| la.total_cmp(lb).then_with(|| a.id.cmp(&b.id)));
        keyed.into_iter().map(|(_, m)| m).collect()
    }
}

/// Sample without replacement proportionally to the rule's weights
///
/// Zero-weight models go last, in id order.
fn weighted<R: Rng + ?Sized>(
    rule: &LoadBalancingRule,
    mut eligible: Vec<RegisteredModel>,
    rng: &mut R,
) -> Vec<RegisteredModel> {
    eligible.sort_by(|a, b| a.id.cmp(&b.id));
    let (mut remaining, zero): (Vec<RegisteredModel>, Vec<RegisteredModel>) = eligible
        .into_iter()
        .partition(|m| rule.weight_of(&m.id) > 0.0);

    let mut ordered = Vec::with_capacity(remaining.len() + zero.len());
    while !remaining.is_empty() {
        let weights: Vec<f64> = remaining.iter().map(|m| rule.weight_of(&m.id)).collect();
        let index = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "Invalid weights, keeping id order");
                0
            }
        };
        ordered.push(remaining.remove(index));
    }
    ordered.extend(zero);
    ordered
}

/// Ascending cost of the expected call
fn cost_optimized(
    request: &LlmRequest,
    prompt_tokens: u32,
    eligible: Vec<RegisteredModel>,
) -> Vec<RegisteredModel> {
    let expected_output = tokens::expected_output_tokens(request);
    let mut keyed: Vec<(f64, RegisteredModel)> = eligible
        .into_iter()
        .map(|m| (m.config.cost_for(prompt_tokens, expected_output), m))
        .collect();
    keyed.sort_by(|(ca, a), (cb, b)| ca.total_cmp(cb).then_with(|| a.id.cmp(&b.id)));
    keyed.into_iter().map(|(_, m)| m).collect()
}

/// Static priority descending, ties by health descending
fn priority(mut eligible: Vec<RegisteredModel>) -> Vec<RegisteredModel> {
    eligible.sort_by(|a, b| {
        b.config
            .priority
            .cmp(&a.config.priority)
            .then_with(|| b.health().partial_cmp(&a.health()).unwrap_or(CmpOrdering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });
    eligible
}
