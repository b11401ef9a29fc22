//! HTTP endpoint integration tests
//!
//! Drives the full router in-process over scripted backends:
//! - POST /v1/complete and GET /v1/requests/:id
//! - POST /v1/tasks and GET /v1/tasks/:id
//! - GET /v1/models, /v1/models/:id and /v1/models/:id/metrics
//! - POST /v1/cache/invalidate
//! - GET /health, /health/live and /v1/health/models

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use switchboard::backend::ScriptedBackend;
use switchboard::balancer::RuleBook;

use crate::common::{model, register, start, test_engine, test_server};

/// Server over one scripted model `test/a` answering "pong"
async fn server_with_model() -> (TestServer, ScriptedBackend) {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::text("pong");
    register(&engine, model("a"), &backend);
    let switchboard = start(engine, None).await;
    (test_server(switchboard), backend)
}

fn completion_body(prompt: &str) -> Value {
    json!({
        "request": {"kind": "completion", "prompt": prompt}
    })
}

#[tokio::test]
async fn test_complete_then_cached() {
    let (server, backend) = server_with_model().await;

    let first = server.post("/v1/complete").json(&completion_body("ping")).await;
    first.assert_status_ok();
    let first: Value = first.json();
    assert_eq!(first["cached"], false);
    assert_eq!(first["model"], "test/a");
    assert_eq!(first["response"]["content"], "pong");
    assert_eq!(first["attempts"], 1);

    let second: Value = server
        .post("/v1/complete")
        .json(&completion_body("ping"))
        .await
        .json();
    assert_eq!(second["cached"], true);
    assert_eq!(backend.calls(), 1);

    let request_id = second["request_id"].as_str().unwrap();
    let record = server.get(&format!("/v1/requests/{}", request_id)).await;
    record.assert_status_ok();
    let record: Value = record.json();
    assert_eq!(record["status"], "cached");
}

#[tokio::test]
async fn test_complete_with_chat_and_options() {
    let (server, backend) = server_with_model().await;

    let body = json!({
        "request": {
            "kind": "chat",
            "messages": [{"role": "user", "content": "hi"}]
        },
        "options": {"skip_cache": true, "deadline_ms": 1000}
    });
    for _ in 0..2 {
        let response: Value = server.post("/v1/complete").json(&body).await.json();
        assert_eq!(response["cached"], false);
    }
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_complete_errors_use_the_error_envelope() {
    let (server, _) = server_with_model().await;

    let unknown_rule = json!({
        "request": {"kind": "completion", "prompt": "x"},
        "options": {"rule": "nope"}
    });
    let response = server.post("/v1/complete").json(&unknown_rule).await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "CONFIGURATION_ERROR");

    let empty = server.post("/v1/complete").json(&completion_body("   ")).await;
    empty.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = empty.json();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let bad_threshold = json!({
        "request": {"kind": "completion", "prompt": "x"},
        "options": {"similarity_threshold": 2.0}
    });
    server
        .post("/v1/complete")
        .json(&bad_threshold)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_no_available_model_is_503() {
    let engine = test_engine(RuleBook::default());
    let switchboard = start(engine, None).await;
    let server = test_server(switchboard);

    let response = server.post("/v1/complete").json(&completion_body("hello")).await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "NO_AVAILABLE_MODEL");
}

#[tokio::test]
async fn test_task_lifecycle() {
    let (server, _) = server_with_model().await;

    let response = server
        .post("/v1/tasks")
        .json(&json!({
            "request": {"kind": "completion", "prompt": "async"},
            "priority": "high"
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let task_id = response.json::<Value>()["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let mut state = Value::Null;
    for _ in 0..200 {
        let status: Value = server.get(&format!("/v1/tasks/{}", task_id)).await.json();
        state = status["state"].clone();
        if state == "completed" || state == "failed" {
            assert_eq!(status["priority"], "high");
            assert_eq!(status["result"]["response"]["content"], "pong");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "completed");
}

#[tokio::test]
async fn test_task_lookup_errors() {
    let (server, _) = server_with_model().await;

    server
        .get("/v1/tasks/not-a-uuid")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    let missing = server
        .get("/v1/tasks/00000000-0000-4000-8000-000000000000")
        .await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["error"]["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_model_listing_and_lookup() {
    let (server, _) = server_with_model().await;

    let list: Value = server.get("/v1/models").await.json();
    assert_eq!(list["object"], "list");
    let data = list["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], "test/a");
    assert_eq!(data[0]["status"], "active");

    let filtered: Value = server
        .get("/v1/models")
        .add_query_param("provider", "elsewhere")
        .await
        .json();
    assert!(filtered["data"].as_array().unwrap().is_empty());

    let by_capability: Value = server
        .get("/v1/models")
        .add_query_param("capability", "embedding")
        .await
        .json();
    assert!(by_capability["data"].as_array().unwrap().is_empty());

    // Model ids carry a slash, so it is percent-encoded in the path
    let one = server.get("/v1/models/test%2Fa").await;
    one.assert_status_ok();
    assert_eq!(one.json::<Value>()["name"], "a");

    let missing = server.get("/v1/models/test%2Fzzz").await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["error"]["code"], "MODEL_NOT_FOUND");
}

#[tokio::test]
async fn test_model_metrics_endpoint() {
    let (server, _) = server_with_model().await;
    server
        .post("/v1/complete")
        .json(&completion_body("count me"))
        .await
        .assert_status_ok();

    let stats: Value = server
        .get("/v1/models/test%2Fa/metrics")
        .add_query_param("window_secs", 60)
        .await
        .json();
    assert_eq!(stats["model"], "test/a");
    assert_eq!(stats["window_secs"], 60);
    assert_eq!(stats["requests"], 1);
    assert_eq!(stats["successes"], 1);

    server
        .get("/v1/models/test%2Fa/metrics")
        .add_query_param("window_secs", 0)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cache_invalidation_endpoint() {
    let (server, backend) = server_with_model().await;
    server
        .post("/v1/complete")
        .json(&completion_body("cache me"))
        .await
        .assert_status_ok();

    server
        .post("/v1/cache/invalidate")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let none: Value = server
        .post("/v1/cache/invalidate")
        .json(&json!({"model": "test/other"}))
        .await
        .json();
    assert_eq!(none["removed"], 0);

    let all: Value = server
        .post("/v1/cache/invalidate")
        .json(&json!({"all": true}))
        .await
        .json();
    assert_eq!(all["removed"], 1);

    let again: Value = server
        .post("/v1/complete")
        .json(&completion_body("cache me"))
        .await
        .json();
    assert_eq!(again["cached"], false);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_health_endpoints() {
    let (server, _) = server_with_model().await;

    let health = server.get("/health").await;
    health.assert_status_ok();
    let health: Value = health.json();
    assert_eq!(health["status"], "healthy");
    assert!(health["checks"].get("redis").is_none());
    assert_eq!(health["stats"]["models"]["total"], 1);
    assert_eq!(health["stats"]["models"]["active"], 1);
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));

    server.get("/health/live").await.assert_status_ok();
    server.get("/health/ready").await.assert_status_ok();

    let scores: Value = server.get("/v1/health/models").await.json();
    assert_eq!(scores["test/a"], 100.0);
}
