//! Load balancing rules

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Candidate ordering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    Weighted,
    LeastLatency,
    CostOptimized,
    Priority,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Weighted => "weighted",
            Strategy::LeastLatency => "least_latency",
            Strategy::CostOptimized => "cost_optimized",
            Strategy::Priority => "priority",
        };
        write!(f, "{}", name)
    }
}

/// Routing policy for a class of requests
///
/// Read-only during a routing decision; replaced only by reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingRule {
    pub name: String,
    pub strategy: Strategy,
    /// Eligible model ids; empty means every registered model
    #[serde(default)]
    pub pool: Vec<String>,
    /// Per-model weights for the weighted strategy; missing weights count as 1
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// Minimum health score a model needs to be eligible
    #[serde(default)]
    pub min_health: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
}

impl LoadBalancingRule {
    pub fn new(name: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            pool: Vec::new(),
            weights: HashMap::new(),
            min_health: 0.0,
            fallback_model: None,
        }
    }

    pub fn with_pool<I, S>(mut self, pool: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pool = pool.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weight(mut self, model: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(model.into(), weight);
        self
    }

    pub fn with_min_health(mut self, min_health: f64) -> Self {
        self.min_health = min_health;
        self
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn weight_of(&self, model: &str) -> f64 {
        self.weights.get(model).copied().unwrap_or(1.0)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Configuration("rule name must not be empty".into()));
        }
        if !(0.0..=100.0).contains(&self.min_health) {
            return Err(EngineError::Configuration(format!(
                "rule {}: min_health must be within 0..=100",
                self.name
            )));
        }
        if let Some((model, weight)) = self
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(EngineError::Configuration(format!(
                "rule {}: weight {} for {} must be finite and non-negative",
                self.name, weight, model
            )));
        }
        Ok(())
    }
}

/// Named rules plus the default one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBook {
    rules: HashMap<String, LoadBalancingRule>,
    default_rule: String,
}

impl Default for RuleBook {
    /// A single `default` rule routing by priority over every model
    fn default() -> Self {
        let rule = LoadBalancingRule::new("default", Strategy::Priority);
        Self {
            rules: HashMap::from([(rule.name.clone(), rule)]),
            default_rule: "default".to_string(),
        }
    }
}

impl RuleBook {
    pub fn new(rules: Vec<LoadBalancingRule>, default_rule: impl Into<String>) -> EngineResult<Self> {
        let default_rule = default_rule.into();
        let mut by_name = HashMap::new();
        for rule in rules {
            rule.validate()?;
            if by_name.contains_key(&rule.name) {
                return Err(EngineError::Configuration(format!(
                    "rule {} is defined twice",
                    rule.name
                )));
            }
            by_name.insert(rule.name.clone(), rule);
        }
        if !by_name.contains_key(&default_rule) {
            return Err(EngineError::Configuration(format!(
                "default rule {} is not defined",
                default_rule
            )));
        }
        Ok(Self {
            rules: by_name,
            default_rule,
        })
    }

    /// A book holding one rule, which is also the default
    pub fn single(rule: LoadBalancingRule) -> EngineResult<Self> {
        let name = rule.name.clone();
        Self::new(vec![rule], name)
    }

    /// Rule by name, or the default rule for `None`
    pub fn get(&self, name: Option<&str>) -> EngineResult<&LoadBalancingRule> {
        let name = name.unwrap_or(self.default_rule.as_str());
        self.rules
            .get(name)
            .ok_or_else(|| EngineError::Configuration(format!("unknown routing rule {}", name)))
    }

    pub fn default_rule(&self) -> &str {
        &self.default_rule
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}
