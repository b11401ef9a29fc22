//! Cache administration endpoint

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    cache::CacheFilter,
    error::{EngineError, EngineResult},
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateBody {
    /// Drop every entry
    #[serde(default)]
    pub all: bool,
    #[serde(flatten)]
    pub filter: CacheFilter,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// Remove cache entries matching the filter
///
/// An empty filter is rejected unless `all` is set.
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InvalidateBody>,
) -> EngineResult<Json<InvalidateResponse>> {
    let filter = body.filter;
    let empty = filter.model.is_none() && filter.kind.is_none() && filter.older_than_secs.is_none();
    let removed = if body.all {
        state.switchboard.invalidate_cache(|_| true)
    } else if empty {
        return Err(EngineError::BadRequest(
            "set a filter field or \"all\": true".into(),
        ));
    } else {
        state.switchboard.invalidate_cache_matching(&filter)
    };
    info!(removed, all = body.all, "Cache invalidated");
    Ok(Json(InvalidateResponse { removed }))
}
