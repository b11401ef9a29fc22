//! Synchronous completion endpoint
//!
//! `POST /v1/complete` runs a request through cache, balancer and executor
//! and answers with the completion. `GET /v1/requests/:id` returns the
//! journaled record of a finished call.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::{
    error::{EngineError, EngineResult},
    executor::{CompleteOptions, Completion, RequestRecord},
    types::LlmRequest,
    AppState,
};

/// Per-call options as they appear on the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireOptions {
    pub rule: Option<String>,
    pub deadline_ms: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub similarity_threshold: Option<f32>,
    pub skip_cache: bool,
}

impl WireOptions {
    pub fn into_options(self) -> EngineResult<CompleteOptions> {
        let mut options = CompleteOptions::default();
        if let Some(rule) = self.rule {
            options = options.with_rule(rule);
        }
        if let Some(ms) = self.deadline_ms {
            if ms == 0 {
                return Err(EngineError::BadRequest("deadline_ms must be positive".into()));
            }
            options = options.with_deadline(Duration::from_millis(ms));
        }
        if let Some(secs) = self.cache_ttl_secs {
            options = options.with_cache_ttl(Duration::from_secs(secs));
        }
        if let Some(threshold) = self.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(EngineError::BadRequest(format!(
                    "similarity_threshold {} outside [0, 1]",
                    threshold
                )));
            }
            options = options.with_similarity_threshold(threshold);
        }
        if self.skip_cache {
            options = options.without_cache();
        }
        Ok(options)
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub request: LlmRequest,
    #[serde(default)]
    pub options: WireOptions,
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompleteBody>,
) -> EngineResult<(StatusCode, Json<Completion>)> {
    let options = body.options.into_options()?;
    let completion = state.switchboard.complete(body.request, options).await?;
    Ok((StatusCode::OK, Json(completion)))
}

pub async fn request_record(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> EngineResult<Json<RequestRecord>> {
    let id = super::parse_id(&request_id)?;
    state
        .switchboard
        .request_record(id)
        .map(Json)
        .ok_or_else(|| EngineError::TaskNotFound(format!("request {}", id)))
}
