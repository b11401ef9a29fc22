//! HTTP routes for Switchboard
//!
//! Thin JSON handlers over the switchboard operations.

pub mod cache;
pub mod complete;
pub mod health;
pub mod models;
pub mod tasks;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::telemetry::export::prometheus_metrics;
use crate::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Model ids contain a slash and must be percent-encoded in paths
    let api_routes = Router::new()
        .route("/v1/complete", post(complete::complete))
        .route("/v1/tasks", post(tasks::enqueue))
        .route("/v1/tasks/:task_id", get(tasks::status))
        .route("/v1/requests/:request_id", get(complete::request_record))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/:model_id", get(models::get_model))
        .route("/v1/models/:model_id/metrics", get(models::model_metrics))
        .route("/v1/health/models", get(health::model_health))
        .route("/v1/cache/invalidate", post(cache::invalidate));

    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/health/live", get(health::liveness_check))
        .route("/metrics", get(prometheus_metrics));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        // Global middleware (applied to all routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}

/// Parse a UUID path segment
pub(crate) fn parse_id(raw: &str) -> crate::error::EngineResult<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|_| crate::error::EngineError::BadRequest(format!("invalid id {}", raw)))
}
