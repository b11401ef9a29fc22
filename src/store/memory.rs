//! In-memory store for testing
//!
//! Same contract as [`RedisStore`](super::RedisStore) without a server.
//! Values go through JSON so tests exercise the same serialization.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Store;
use crate::cache::CacheEntrySnapshot;
use crate::error::EngineResult;
use crate::registry::ModelConfig;
use crate::telemetry::MetricsSnapshot;

#[derive(Default)]
pub struct MemoryStore {
    models: RwLock<BTreeMap<String, String>>,
    cache: RwLock<Option<String>>,
    metrics: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_count(&self) -> usize {
        self.models.read().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_model(&self, config: &ModelConfig) -> EngineResult<()> {
        let serialized = serde_json::to_string(config)?;
        self.models.write().insert(config.id(), serialized);
        Ok(())
    }

    async fn delete_model(&self, id: &str) -> EngineResult<()> {
        self.models.write().remove(id);
        Ok(())
    }

    async fn load_models(&self) -> EngineResult<Vec<ModelConfig>> {
        let models = self.models.read();
        let configs = models
            .values()
            .map(|v| serde_json::from_str(v))
            .collect::<Result<Vec<ModelConfig>, _>>()?;
        Ok(configs)
    }

    async fn save_cache(&self, entries: &[CacheEntrySnapshot]) -> EngineResult<()> {
        *self.cache.write() = Some(serde_json::to_string(entries)?);
        Ok(())
    }

    async fn load_cache(&self) -> EngineResult<Vec<CacheEntrySnapshot>> {
        match self.cache.read().as_deref() {
            Some(v) => Ok(serde_json::from_str(v)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_metrics(&self, snapshot: &MetricsSnapshot) -> EngineResult<()> {
        *self.metrics.write() = Some(serde_json::to_string(snapshot)?);
        Ok(())
    }

    async fn load_metrics(&self) -> EngineResult<Option<MetricsSnapshot>> {
        match self.metrics.read().as_deref() {
            Some(v) => Ok(Some(serde_json::from_str(v)?)),
            None => Ok(None),
        }
    }
}
