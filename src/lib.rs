//! Switchboard - routing, caching and health engine for LLM backends
//!
//! This library picks a backend model for each request, serves repeated
//! requests from an exact or semantic cache, fails over across models
//! under per-model concurrency and rate limits, and scores model health
//! from the outcomes it observes.

pub mod backend;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod routes;
pub mod store;
pub mod telemetry;
pub mod tokens;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

pub use crate::config::{Catalog, Config};
pub use crate::engine::{Engine, EngineConfig, Switchboard, SwitchboardConfig};
pub use crate::error::{EngineError, EngineResult};
pub use crate::executor::{CompleteOptions, Completion};
pub use crate::queue::Priority;
pub use crate::types::{LlmRequest, LlmResponse, Message};

use crate::backend::{Embedder, OpenAiEmbedder};
use crate::store::{RedisStore, Store};

/// Application state shared across all request handlers
pub struct AppState {
    pub config: Config,
    pub switchboard: Arc<Switchboard>,
    /// Connection used by the persistence store, checked by `/health`
    pub redis: Option<redis::aio::ConnectionManager>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the engine from configuration and start background work
    pub async fn new(config: Config) -> Result<Self> {
        // Initialize HTTP client with connection pooling
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .timeout(Duration::from_secs(300))
            .build()?;

        let catalog = match &config.catalog_path {
            Some(path) => Catalog::load(path)?,
            None => Catalog::default(),
        };
        let rules = catalog.rule_book()?;

        let embedder: Option<Arc<dyn Embedder>> = config.embedding_api_url.as_ref().map(|url| {
            Arc::new(OpenAiEmbedder::new(
                http_client.clone(),
                url.as_str(),
                config.embedding_api_key.clone(),
                config.embedding_model.as_str(),
            )) as Arc<dyn Embedder>
        });

        let engine = Arc::new(Engine::with_http_client(
            config.engine(),
            rules,
            embedder,
            http_client,
        ));

        let (store, redis): (Option<Arc<dyn Store>>, _) = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                let conn = redis::aio::ConnectionManager::new(client)
                    .await
                    .context("Failed to connect to Redis")?;
                info!("Persistence enabled");
                (Some(Arc::new(RedisStore::new(conn.clone()))), Some(conn))
            }
            None => (None, None),
        };

        let switchboard = Switchboard::start(engine.clone(), config.switchboard(), store).await;

        // Catalog entries win over restored configs
        for model in catalog.models {
            if engine.registry().contains(&model.id()) {
                engine.update_model(model)?;
            } else {
                switchboard.register_endpoint_model(model).await?;
            }
        }
        info!(models = engine.registry().len(), "Model catalog applied");

        Ok(Self {
            config,
            switchboard: Arc::new(switchboard),
            redis,
            start_time: Instant::now(),
        })
    }

    /// State around an already started switchboard, without Redis
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(config: Config, switchboard: Arc<Switchboard>) -> Self {
        Self {
            config,
            switchboard,
            redis: None,
            start_time: Instant::now(),
        }
    }
}
