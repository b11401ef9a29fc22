//! Redis-backed store
//!
//! Values are JSON strings. Model configs live in one hash keyed by model
//! id; cache entries and the metrics snapshot are single keys replaced on
//! every save.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::Store;
use crate::cache::CacheEntrySnapshot;
use crate::error::EngineResult;
use crate::registry::ModelConfig;
use crate::telemetry::MetricsSnapshot;

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self::with_prefix(conn, keys::DEFAULT_PREFIX)
    }

    /// Store whose keys live under `prefix:` instead of the default
    pub fn with_prefix(conn: redis::aio::ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Open a managed connection to `url`
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(value)?;
        let _: () = conn.set(key, serialized).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn save_model(&self, config: &ModelConfig) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(config)?;
        let _: () = conn.hset(keys::models(&self.prefix), config.id(), serialized).await?;
        Ok(())
    }

    async fn delete_model(&self, id: &str) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(keys::models(&self.prefix), id).await?;
        Ok(())
    }

    async fn load_models(&self) -> EngineResult<Vec<ModelConfig>> {
        let mut conn = self.conn.clone();
        let stored: HashMap<String, String> = conn.hgetall(keys::models(&self.prefix)).await?;
        let mut configs = stored
            .values()
            .map(|v| serde_json::from_str::<ModelConfig>(v))
            .collect::<Result<Vec<_>, _>>()?;
        configs.sort_by_key(|c| c.id());
        debug!(count = configs.len(), "Loaded model configs from Redis");
        Ok(configs)
    }

    async fn save_cache(&self, entries: &[CacheEntrySnapshot]) -> EngineResult<()> {
        self.set_json(&keys::cache(&self.prefix), entries).await
    }

    async fn load_cache(&self) -> EngineResult<Vec<CacheEntrySnapshot>> {
        Ok(self.get_json(&keys::cache(&self.prefix)).await?.unwrap_or_default())
    }

    async fn save_metrics(&self, snapshot: &MetricsSnapshot) -> EngineResult<()> {
        self.set_json(&keys::metrics(&self.prefix), snapshot).await
    }

    async fn load_metrics(&self) -> EngineResult<Option<MetricsSnapshot>> {
        self.get_json(&keys::metrics(&self.prefix)).await
    }
}

/// Store key names
pub mod keys {
    pub const DEFAULT_PREFIX: &str = "switchboard";

    /// Hash of model configs keyed by model id
    pub fn models(prefix: &str) -> String {
        format!("{}:models", prefix)
    }

    pub fn cache(prefix: &str) -> String {
        format!("{}:cache", prefix)
    }

    pub fn metrics(prefix: &str) -> String {
        format!("{}:metrics", prefix)
    }
}
