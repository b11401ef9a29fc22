//! Configuration management for Switchboard
//!
//! Runtime settings come from environment variables; models and routing
//! rules come from a JSON catalog file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::balancer::{LoadBalancingRule, RuleBook};
use crate::cache::CacheConfig;
use crate::engine::{EngineConfig, SwitchboardConfig};
use crate::executor::ExecutorConfig;
use crate::queue::QueueConfig;
use crate::registry::ModelConfig;
use crate::telemetry::TelemetryConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,

    /// Model catalog file
    pub catalog_path: Option<String>,
    /// Redis connection URL; persistence is disabled without it
    pub redis_url: Option<String>,

    pub cache_capacity: usize,
    pub cache_ttl_seconds: u64,
    /// Semantic matching is off unless a threshold is set
    pub semantic_threshold: Option<f32>,

    /// OpenAI-compatible embeddings endpoint for the semantic cache
    pub embedding_api_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,

    pub request_timeout_ms: u64,
    pub slot_wait_ms: u64,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,

    pub queue_workers: usize,
    pub queue_max_retries: u32,
    pub queue_capacity: usize,
    pub queue_retention_seconds: u64,

    pub metrics_bucket_seconds: u64,
    pub metrics_retention_buckets: usize,

    pub maintenance_interval_seconds: u64,
    pub snapshot_interval_seconds: u64,
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn optional<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {}", name)),
        _ => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            catalog_path: None,
            redis_url: None,
            cache_capacity: 10_000,
            cache_ttl_seconds: 3600,
            semantic_threshold: None,
            embedding_api_url: None,
            embedding_api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_ms: 30_000,
            slot_wait_ms: 250,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 5_000,
            queue_workers: 4,
            queue_max_retries: 3,
            queue_capacity: 10_000,
            queue_retention_seconds: 3600,
            metrics_bucket_seconds: 3600,
            metrics_retention_buckets: 24,
            maintenance_interval_seconds: 30,
            snapshot_interval_seconds: 300,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let config = Self {
            host: env::var("SWITCHBOARD_HOST").unwrap_or(d.host),
            port: parsed("SWITCHBOARD_PORT", d.port)?,

            catalog_path: optional("SWITCHBOARD_CATALOG")?,
            redis_url: optional("REDIS_URL")?,

            cache_capacity: parsed("CACHE_CAPACITY", d.cache_capacity)?,
            cache_ttl_seconds: parsed("CACHE_TTL_SECONDS", d.cache_ttl_seconds)?,
            semantic_threshold: optional("SEMANTIC_CACHE_THRESHOLD")?,

            embedding_api_url: optional("EMBEDDING_API_URL")?,
            embedding_api_key: optional("EMBEDDING_API_KEY")?,
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or(d.embedding_model),

            request_timeout_ms: parsed("REQUEST_TIMEOUT_MS", d.request_timeout_ms)?,
            slot_wait_ms: parsed("SLOT_WAIT_MS", d.slot_wait_ms)?,
            retry_backoff_ms: parsed("RETRY_BACKOFF_MS", d.retry_backoff_ms)?,
            retry_backoff_max_ms: parsed("RETRY_BACKOFF_MAX_MS", d.retry_backoff_max_ms)?,

            queue_workers: parsed("QUEUE_WORKERS", d.queue_workers)?,
            queue_max_retries: parsed("QUEUE_MAX_RETRIES", d.queue_max_retries)?,
            queue_capacity: parsed("QUEUE_CAPACITY", d.queue_capacity)?,
            queue_retention_seconds: parsed("QUEUE_RETENTION_SECONDS", d.queue_retention_seconds)?,

            metrics_bucket_seconds: parsed("METRICS_BUCKET_SECONDS", d.metrics_bucket_seconds)?,
            metrics_retention_buckets: parsed(
                "METRICS_RETENTION_BUCKETS",
                d.metrics_retention_buckets,
            )?,

            maintenance_interval_seconds: parsed(
                "MAINTENANCE_INTERVAL_SECONDS",
                d.maintenance_interval_seconds,
            )?,
            snapshot_interval_seconds: parsed(
                "SNAPSHOT_INTERVAL_SECONDS",
                d.snapshot_interval_seconds,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.semantic_threshold {
            anyhow::ensure!(
                (0.0..=1.0).contains(&threshold),
                "SEMANTIC_CACHE_THRESHOLD must be within 0..=1"
            );
        }
        anyhow::ensure!(self.metrics_bucket_seconds > 0, "METRICS_BUCKET_SECONDS must be > 0");
        anyhow::ensure!(self.metrics_retention_buckets > 1, "METRICS_RETENTION_BUCKETS must be > 1");
        anyhow::ensure!(self.request_timeout_ms > 0, "REQUEST_TIMEOUT_MS must be > 0");
        anyhow::ensure!(self.maintenance_interval_seconds > 0, "MAINTENANCE_INTERVAL_SECONDS must be > 0");
        anyhow::ensure!(self.snapshot_interval_seconds > 0, "SNAPSHOT_INTERVAL_SECONDS must be > 0");
        Ok(())
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            default_ttl: Duration::from_secs(self.cache_ttl_seconds),
            similarity_threshold: self.semantic_threshold,
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            slot_wait: Duration::from_millis(self.slot_wait_ms),
            default_deadline: Duration::from_millis(self.request_timeout_ms),
            backoff_base: Duration::from_millis(self.retry_backoff_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            bucket: Duration::from_secs(self.metrics_bucket_seconds),
            retention_buckets: self.metrics_retention_buckets,
            ..TelemetryConfig::default()
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            workers: self.queue_workers,
            max_retries: self.queue_max_retries,
            capacity: self.queue_capacity,
            retention: Duration::from_secs(self.queue_retention_seconds),
            ..QueueConfig::default()
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            cache: self.cache(),
            executor: self.executor(),
            telemetry: self.telemetry(),
            ..EngineConfig::default()
        }
    }

    pub fn switchboard(&self) -> SwitchboardConfig {
        SwitchboardConfig {
            queue: self.queue(),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_seconds),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_seconds),
        }
    }
}

/// Models and routing rules loaded at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub rules: Vec<LoadBalancingRule>,
    pub default_rule: Option<String>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid catalog {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The catalog's rules, or the built-in default when it has none
    pub fn rule_book(&self) -> Result<RuleBook> {
        if self.rules.is_empty() {
            return Ok(RuleBook::default());
        }
        let default_rule = self
            .default_rule
            .clone()
            .unwrap_or_else(|| self.rules[0].name.clone());
        Ok(RuleBook::new(self.rules.clone(), default_rule)?)
    }
}
