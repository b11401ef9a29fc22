//! Model endpoints
//!
//! Lists registered models with their live status and exposes per-model
//! windowed statistics.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{EngineError, EngineResult},
    registry::{ModelFilter, ModelView},
    telemetry::ModelStats,
    AppState,
};

/// Models list response
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelView>,
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ModelFilter>,
) -> Json<ModelsResponse> {
    let data = state
        .switchboard
        .engine()
        .list_models(&filter)
        .iter()
        .map(|m| m.view())
        .collect();
    Json(ModelsResponse {
        object: "list",
        data,
    })
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> EngineResult<Json<ModelView>> {
    state
        .switchboard
        .engine()
        .registry()
        .get(&model_id)
        .map(|m| Json(m.view()))
        .ok_or(EngineError::ModelNotFound(model_id))
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    300
}

pub async fn model_metrics(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> EngineResult<Json<ModelStats>> {
    if query.window_secs == 0 {
        return Err(EngineError::BadRequest("window_secs must be positive".into()));
    }
    let stats = state
        .switchboard
        .metrics(&model_id, Duration::from_secs(query.window_secs))?;
    Ok(Json(stats))
}
