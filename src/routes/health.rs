//! Health check endpoints
//!
//! Provides endpoints for monitoring and container orchestration:
//! - `/health` - Full health check with dependency and model status
//! - `/health/ready` - Readiness probe
//! - `/health/live` - Liveness probe
//! - `/v1/health/models` - Health score of every model

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::registry::{ModelFilter, ModelStatus};
use crate::AppState;

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual dependency check result
#[derive(Debug, Serialize)]
pub struct DependencyCheck {
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dependency checks collection
#[derive(Debug, Serialize)]
pub struct DependencyChecks {
    /// Absent when persistence is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<DependencyCheck>,
}

/// Registered models by status
#[derive(Debug, Default, Serialize)]
pub struct ModelCounts {
    pub total: usize,
    pub active: usize,
    pub degraded: usize,
    pub suspended: usize,
}

/// Application statistics
#[derive(Debug, Serialize)]
pub struct HealthStats {
    pub uptime_seconds: u64,
    pub queue_depth: usize,
    pub cache_entries: usize,
    pub models: ModelCounts,
}

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: String,
    pub checks: DependencyChecks,
    pub stats: HealthStats,
}

/// Simple health response for liveness/readiness
#[derive(Debug, Serialize)]
pub struct SimpleHealthResponse {
    pub status: HealthStatus,
}

/// Check Redis connectivity
async fn check_redis(state: &AppState) -> Option<DependencyCheck> {
    let mut conn = state.redis.clone()?;
    let start = Instant::now();

    let check = match redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
    {
        Ok(_) => DependencyCheck {
            status: HealthStatus::Healthy,
            latency_ms: start.elapsed().as_millis() as u64,
            error: None,
        },
        Err(e) => DependencyCheck {
            status: HealthStatus::Unhealthy,
            latency_ms: start.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
        },
    };
    Some(check)
}

fn model_counts(state: &AppState) -> ModelCounts {
    let models = state
        .switchboard
        .engine()
        .list_models(&ModelFilter::default());
    let mut counts = ModelCounts {
        total: models.len(),
        ..Default::default()
    };
    for model in &models {
        match model.status() {
            ModelStatus::Active => counts.active += 1,
            ModelStatus::Degraded => counts.degraded += 1,
            ModelStatus::Suspended => counts.suspended += 1,
        }
    }
    counts
}

/// Full health check endpoint
///
/// Unhealthy when Redis is configured and unreachable; degraded when
/// models are registered but none of them is active.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let redis_check = check_redis(&state).await;
    let models = model_counts(&state);

    let redis_down = redis_check
        .as_ref()
        .is_some_and(|c| c.status == HealthStatus::Unhealthy);
    let overall_status = if redis_down {
        HealthStatus::Unhealthy
    } else if models.total > 0 && models.active == 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let uptime = state.start_time.elapsed().as_secs();

    let response = HealthResponse {
        status: overall_status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks: DependencyChecks { redis: redis_check },
        stats: HealthStats {
            uptime_seconds: uptime,
            queue_depth: state.switchboard.queue_depth(),
            cache_entries: state.switchboard.engine().cache().len(),
            models,
        },
    };

    let status_code = match overall_status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Readiness probe endpoint
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<SimpleHealthResponse>) {
    let redis_down = check_redis(&state)
        .await
        .is_some_and(|c| c.status == HealthStatus::Unhealthy);

    if redis_down {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SimpleHealthResponse {
                status: HealthStatus::Unhealthy,
            }),
        );
    }

    (
        StatusCode::OK,
        Json(SimpleHealthResponse {
            status: HealthStatus::Healthy,
        }),
    )
}

/// Liveness probe endpoint
///
/// Always 200 while the process can serve requests.
pub async fn liveness_check() -> (StatusCode, Json<SimpleHealthResponse>) {
    (
        StatusCode::OK,
        Json(SimpleHealthResponse {
            status: HealthStatus::Healthy,
        }),
    )
}

/// Health score of every registered model, in `[0, 100]`
pub async fn model_health(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, f64>> {
    Json(state.switchboard.health())
}
