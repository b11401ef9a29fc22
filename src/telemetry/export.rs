//! Prometheus export
//!
//! Mirrors the collector's events onto the `metrics` facade so they can
//! be scraped at `/metrics`.

use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: Lazy<PrometheusHandle> = Lazy::new(|| {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
});

/// Initialize metrics (call once at startup)
pub fn init_metrics() {
    let _ = &*PROMETHEUS_HANDLE;
    describe_metrics();
}

fn describe_metrics() {
    metrics::describe_counter!(
        "switchboard_requests_total",
        "Completed requests by final status"
    );
    metrics::describe_counter!(
        "switchboard_attempts_total",
        "Backend attempts by model and outcome"
    );
    metrics::describe_histogram!(
        "switchboard_request_duration_seconds",
        "Backend call latency in seconds"
    );
    metrics::describe_counter!("switchboard_tokens_total", "Tokens processed");
    metrics::describe_counter!(
        "switchboard_cache_operations_total",
        "Cache lookups, writes and evictions"
    );
    metrics::describe_gauge!("switchboard_model_health", "Current model health score");
    metrics::describe_gauge!("switchboard_queue_depth", "Tasks waiting in the request queue");
}

/// Prometheus metrics endpoint handler
pub async fn prometheus_metrics() -> impl IntoResponse {
    PROMETHEUS_HANDLE.render()
}

/// Record the terminal status of a request
pub fn record_request(status: &str) {
    metrics::counter!("switchboard_requests_total", "status" => status.to_string()).increment(1);
}

/// Record one backend attempt
pub fn record_attempt(model: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "switchboard_attempts_total",
        "model" => model.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("switchboard_request_duration_seconds", "model" => model.to_string())
        .record(duration_secs);
}

/// Record tokens processed
pub fn record_tokens(token_type: &str, count: u64, model: &str) {
    metrics::counter!(
        "switchboard_tokens_total",
        "type" => token_type.to_string(),
        "model" => model.to_string()
    )
    .increment(count);
}

/// Record cache operation
pub fn record_cache_operation(operation: &str, result: &str) {
    metrics::counter!(
        "switchboard_cache_operations_total",
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn set_model_health(model: &str, score: f64) {
    metrics::gauge!("switchboard_model_health", "model" => model.to_string()).set(score);
}

pub fn set_queue_depth(depth: f64) {
    metrics::gauge!("switchboard_queue_depth").set(depth);
}
