//! Persistence interface
//!
//! Store/load pairs for model configs, cache entries and metrics
//! snapshots. The engine never treats the store as transactional: a
//! failed save is logged and retried on the next snapshot.

mod redis;
#[cfg(any(test, feature = "test-utils"))]
mod memory;

pub use self::redis::{keys, RedisStore};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::cache::CacheEntrySnapshot;
use crate::error::EngineResult;
use crate::registry::ModelConfig;
use crate::telemetry::MetricsSnapshot;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace one model config, keyed by its id
    async fn save_model(&self, config: &ModelConfig) -> EngineResult<()>;

    async fn delete_model(&self, id: &str) -> EngineResult<()>;

    /// Every stored model config, ordered by id
    async fn load_models(&self) -> EngineResult<Vec<ModelConfig>>;

    /// Replace the stored cache entries
    async fn save_cache(&self, entries: &[CacheEntrySnapshot]) -> EngineResult<()>;

    async fn load_cache(&self) -> EngineResult<Vec<CacheEntrySnapshot>>;

    /// Replace the stored metrics snapshot
    async fn save_metrics(&self, snapshot: &MetricsSnapshot) -> EngineResult<()>;

    async fn load_metrics(&self) -> EngineResult<Option<MetricsSnapshot>>;
}
