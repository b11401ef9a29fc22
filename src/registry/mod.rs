//! Model registry
//!
//! Holds the static configuration and the dynamic runtime state of every
//! registered backend model. One registry instance is created at startup
//! and shared by handle with every other component.

mod model;

pub use model::{
    Capability, Endpoint, EndpointKind, InFlightGuard, ModelConfig, ModelRuntimeState,
    ModelStatus, WindowCounters,
};

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};

/// A registered model: configuration plus its runtime state
#[derive(Debug, Clone)]
pub struct RegisteredModel {
    pub id: String,
    pub config: Arc<ModelConfig>,
    pub runtime: Arc<ModelRuntimeState>,
}

impl RegisteredModel {
    pub fn health(&self) -> f64 {
        self.runtime.health()
    }

    pub fn status(&self) -> ModelStatus {
        self.runtime.status()
    }

    /// Serializable view for listings
    pub fn view(&self) -> ModelView {
        ModelView {
            id: self.id.clone(),
            config: (*self.config).clone(),
            status: self.status(),
            health: self.health(),
            in_flight: self.runtime.in_flight(),
            window: self.runtime.window(),
        }
    }
}

/// Point-in-time view of a registered model
#[derive(Debug, Clone, Serialize)]
pub struct ModelView {
    pub id: String,
    #[serde(flatten)]
    pub config: ModelConfig,
    pub status: ModelStatus,
    pub health: f64,
    pub in_flight: u32,
    pub window: WindowCounters,
}

/// Filter for [`ModelRegistry::list`]; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelFilter {
    pub provider: Option<String>,
    pub capability: Option<Capability>,
    pub status: Option<ModelStatus>,
}

impl ModelFilter {
    fn matches(&self, model: &RegisteredModel) -> bool {
        self.provider
            .as_deref()
            .map_or(true, |p| model.config.provider == p)
            && self
                .capability
                .map_or(true, |c| model.config.supports(c))
            && self.status.map_or(true, |s| model.status() == s)
    }
}

/// Registry of backend models keyed by model id
#[derive(Default)]
pub struct ModelRegistry {
    models: DashMap<String, RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new model
    ///
    /// Fails with `Configuration` on a duplicate id or invalid limits.
    #[instrument(skip(self, config), fields(model = %config.id()))]
    pub fn register(&self, config: ModelConfig) -> EngineResult<RegisteredModel> {
        config.validate()?;
        let id = config.id();

        match self.models.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::Configuration(
                format!("model {} is already registered", id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let model = RegisteredModel {
                    id: id.clone(),
                    config: Arc::new(config),
                    runtime: Arc::new(ModelRuntimeState::default()),
                };
                slot.insert(model.clone());
                info!(
                    model = %id,
                    concurrency = model.config.concurrency_limit,
                    rate_limit = ?model.config.rate_limit_per_minute,
                    "Model registered"
                );
                Ok(model)
            }
        }
    }

    /// Replace the configuration of a registered model, keeping its runtime state
    #[instrument(skip(self, config), fields(model = %config.id()))]
    pub fn update_config(&self, config: ModelConfig) -> EngineResult<RegisteredModel> {
        config.validate()?;
        let id = config.id();

        let mut entry = self
            .models
            .get_mut(&id)
            .ok_or_else(|| EngineError::ModelNotFound(id.clone()))?;
        entry.config = Arc::new(config);
        info!(model = %id, "Model configuration updated");
        Ok(entry.clone())
    }

    pub fn get(&self, id: &str) -> Option<RegisteredModel> {
        self.models.get(id).map(|m| m.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// Models matching the filter, ordered by id
    pub fn list(&self, filter: &ModelFilter) -> Vec<RegisteredModel> {
        let mut models: Vec<RegisteredModel> = self
            .models
            .iter()
            .filter(|m| filter.matches(m.value()))
            .map(|m| m.value().clone())
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Set the operational status of a model
    ///
    /// The only mutator used outside configuration reload.
    pub fn update_status(&self, id: &str, status: ModelStatus) -> EngineResult<()> {
        let model = self
            .models
            .get(id)
            .ok_or_else(|| EngineError::ModelNotFound(id.to_string()))?;
        let previous = model.runtime.swap_status(status);
        if previous != status {
            match status {
                ModelStatus::Suspended => warn!(
                    model = %id,
                    from = %previous,
                    health = model.runtime.health(),
                    "Model suspended"
                ),
                _ => info!(
                    model = %id,
                    from = %previous,
                    to = %status,
                    health = model.runtime.health(),
                    "Model status changed"
                ),
            }
        }
        Ok(())
    }

    /// Configurations of every model, ordered by id
    pub fn configs(&self) -> Vec<ModelConfig> {
        self.list(&ModelFilter::default())
            .into_iter()
            .map(|m| (*m.config).clone())
            .collect()
    }
}
