//! Asynchronous task endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::complete::WireOptions;
use crate::{
    error::EngineResult,
    queue::{Priority, TaskStatus},
    types::LlmRequest,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub request: LlmRequest,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub options: WireOptions,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub task_id: Uuid,
}

/// Queue a request; the task id is polled through `GET /v1/tasks/:id`
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnqueueBody>,
) -> EngineResult<(StatusCode, Json<EnqueueResponse>)> {
    let options = body.options.into_options()?;
    let task_id = state
        .switchboard
        .enqueue_with(body.request, body.priority, options)?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { task_id })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> EngineResult<Json<TaskStatus>> {
    let id = super::parse_id(&task_id)?;
    Ok(Json(state.switchboard.status(id)?))
}
