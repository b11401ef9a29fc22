//! Model configuration and runtime state

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::RequestKind;

/// Capability a model advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Embedding,
    Vision,
    Tools,
}

impl Capability {
    /// Capability a request of the given kind needs
    pub fn required_for(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Chat => Capability::Chat,
            RequestKind::Completion => Capability::Completion,
            RequestKind::Embedding => Capability::Embedding,
        }
    }
}

/// Wire protocol spoken by an HTTP endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// OpenAI-compatible API (OpenAI, vLLM, Ollama, llama.cpp server, ...)
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API
    Anthropic,
}

/// Where and how to reach a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub base_url: String,
    /// Name of the environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Static configuration of one backend model
///
/// Owned by the registry. Changed only by configuration load, never by
/// request processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name (e.g., "openai", "anthropic")
    pub provider: String,
    /// Provider-side model name (e.g., "gpt-4o-mini")
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub max_context_tokens: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Price per 1K input tokens
    #[serde(default)]
    pub input_cost_per_1k: f64,
    /// Price per 1K output tokens
    #[serde(default)]
    pub output_cost_per_1k: f64,
    /// Maximum concurrent in-flight calls
    pub concurrency_limit: u32,
    /// Token bucket size and refill per minute; `None` disables rate limiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    /// Static priority weight, higher is preferred
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
}

fn default_max_output_tokens() -> u32 {
    4096
}

impl ModelConfig {
    /// Create a config with sane defaults for the given identity
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
            version: None,
            capabilities: [Capability::Chat, Capability::Completion].into_iter().collect(),
            max_context_tokens: 8192,
            max_output_tokens: default_max_output_tokens(),
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            concurrency_limit: 8,
            rate_limit_per_minute: None,
            priority: 0,
            endpoint: None,
        }
    }

    /// Registry identity: `provider/name` or `provider/name@version`
    pub fn id(&self) -> String {
        match &self.version {
            Some(version) => format!("{}/{}@{}", self.provider, self.name, version),
            None => format!("{}/{}", self.provider, self.name),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Cost of a call with the given token usage
    pub fn cost_for(&self, tokens_in: u32, tokens_out: u32) -> f64 {
        (tokens_in as f64 / 1000.0) * self.input_cost_per_1k
            + (tokens_out as f64 / 1000.0) * self.output_cost_per_1k
    }

    /// Reject configurations the engine cannot operate
    pub fn validate(&self) -> EngineResult<()> {
        if self.provider.trim().is_empty() || self.name.trim().is_empty() {
            return Err(EngineError::Configuration(
                "model provider and name must not be empty".to_string(),
            ));
        }
        let id = self.id();
        if self.concurrency_limit == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: concurrency_limit must be greater than zero",
                id
            )));
        }
        if self.rate_limit_per_minute == Some(0) {
            return Err(EngineError::Configuration(format!(
                "{}: rate_limit_per_minute must be greater than zero when set",
                id
            )));
        }
        if self.max_context_tokens == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: max_context_tokens must be greater than zero",
                id
            )));
        }
        let costs = [self.input_cost_per_1k, self.output_cost_per_1k];
        if costs.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(EngineError::Configuration(format!(
                "{}: costs must be finite and non-negative",
                id
            )));
        }
        if self.capabilities.is_empty() {
            return Err(EngineError::Configuration(format!(
                "{}: at least one capability is required",
                id
            )));
        }
        Ok(())
    }
}

/// Operational status of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Active,
    Degraded,
    Suspended,
}

impl ModelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ModelStatus::Degraded,
            2 => ModelStatus::Suspended,
            _ => ModelStatus::Active,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ModelStatus::Active => 0,
            ModelStatus::Degraded => 1,
            ModelStatus::Suspended => 2,
        }
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Active => write!(f, "active"),
            ModelStatus::Degraded => write!(f, "degraded"),
            ModelStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// Counts of the current metrics window, published by the collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounters {
    pub requests: u64,
    pub errors: u64,
    pub timeouts: u64,
}

/// Dynamic state of one model
///
/// Every field is an independent atomic; readers never lock.
#[derive(Debug)]
pub struct ModelRuntimeState {
    health_bits: AtomicU64,
    status: AtomicU8,
    in_flight: AtomicU32,
    window_requests: AtomicU64,
    window_errors: AtomicU64,
    window_timeouts: AtomicU64,
}

impl Default for ModelRuntimeState {
    fn default() -> Self {
        Self {
            health_bits: AtomicU64::new(100.0f64.to_bits()),
            status: AtomicU8::new(ModelStatus::Active.as_u8()),
            in_flight: AtomicU32::new(0),
            window_requests: AtomicU64::new(0),
            window_errors: AtomicU64::new(0),
            window_timeouts: AtomicU64::new(0),
        }
    }
}

impl ModelRuntimeState {
    pub fn health(&self) -> f64 {
        f64::from_bits(self.health_bits.load(Ordering::Acquire))
    }

    pub(crate) fn set_health(&self, score: f64) {
        self.health_bits
            .store(score.clamp(0.0, 100.0).to_bits(), Ordering::Release);
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Store a new status, returning the previous one
    pub(crate) fn swap_status(&self, status: ModelStatus) -> ModelStatus {
        ModelStatus::from_u8(self.status.swap(status.as_u8(), Ordering::AcqRel))
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count an in-flight call until the returned guard drops
    pub fn enter(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: &self.in_flight,
        }
    }

    pub fn window(&self) -> WindowCounters {
        WindowCounters {
            requests: self.window_requests.load(Ordering::Acquire),
            errors: self.window_errors.load(Ordering::Acquire),
            timeouts: self.window_timeouts.load(Ordering::Acquire),
        }
    }

    pub(crate) fn publish_window(&self, counters: WindowCounters) {
        self.window_requests
            .store(counters.requests, Ordering::Release);
        self.window_errors.store(counters.errors, Ordering::Release);
        self.window_timeouts
            .store(counters.timeouts, Ordering::Release);
    }
}

/// Decrements the in-flight counter on drop
pub struct InFlightGuard<'a> {
    counter: &'a AtomicU32,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
