//! Asynchronous request queue through the switchboard
//!
//! Tasks run on the worker pool. Retryable failures are re-queued with
//! backoff until the retry budget is spent.

use std::time::Duration;

use switchboard::backend::{Reply, ScriptedBackend};
use switchboard::balancer::RuleBook;
use switchboard::error::ProviderError;
use switchboard::queue::TaskState;
use switchboard::{CompleteOptions, EngineError, LlmRequest, Priority};
use uuid::Uuid;

use crate::common::{model, register, start, test_engine, wait_for_task};

#[tokio::test]
async fn test_enqueued_request_completes() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::text("queued answer");
    register(&engine, model("a"), &backend);
    let switchboard = start(engine, None).await;

    let id = switchboard
        .enqueue(LlmRequest::completion("later please"), Priority::Normal)
        .unwrap();
    let status = wait_for_task(&switchboard, id).await;

    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.runs, 1);
    let result = status.result.expect("Completed task carries its result");
    assert_eq!(result.response.content, "queued answer");
    assert!(status.error.is_none());

    switchboard.shutdown().await;
}

#[tokio::test]
async fn test_retryable_failure_is_requeued() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::text("recovered")
        .then(Reply::Fail(ProviderError::Unknown("HTTP 502".into())));
    register(&engine, model("a"), &backend);
    let switchboard = start(engine, None).await;

    let id = switchboard
        .enqueue(LlmRequest::completion("flaky"), Priority::High)
        .unwrap();
    let status = wait_for_task(&switchboard, id).await;

    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.runs, 2);
    assert_eq!(backend.calls(), 2);

    switchboard.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::failing(ProviderError::Unknown("HTTP 500".into()));
    register(&engine, model("a"), &backend);
    let switchboard = start(engine, None).await;

    let id = switchboard
        .enqueue(LlmRequest::completion("doomed"), Priority::Normal)
        .unwrap();
    let status = wait_for_task(&switchboard, id).await;

    // One run plus the default three retries
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.runs, 4);
    assert!(status.error.is_some());
    assert_eq!(backend.calls(), 4);

    switchboard.shutdown().await;
}

#[tokio::test]
async fn test_configuration_error_is_not_retried() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::echo();
    register(&engine, model("a"), &backend);
    let switchboard = start(engine, None).await;

    let id = switchboard
        .enqueue_with(
            LlmRequest::completion("misrouted"),
            Priority::Low,
            CompleteOptions::default().with_rule("missing"),
        )
        .unwrap();
    let status = wait_for_task(&switchboard, id).await;

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.runs, 1);
    assert_eq!(backend.calls(), 0);

    switchboard.shutdown().await;
}

#[tokio::test]
async fn test_unknown_task_and_closed_queue() {
    let engine = test_engine(RuleBook::default());
    let switchboard = start(engine, None).await;

    let err = switchboard.status(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, EngineError::TaskNotFound(_)));

    switchboard.shutdown().await;
    let err = switchboard
        .enqueue(LlmRequest::completion("too late"), Priority::Critical)
        .unwrap_err();
    assert!(matches!(err, EngineError::QueueClosed));
}

#[tokio::test]
async fn test_rate_limited_task_waits_instead_of_failing() {
    const LIMIT: u32 = 60;
    let engine = test_engine(RuleBook::default());
    let mut limited = model("a");
    limited.rate_limit_per_minute = Some(LIMIT);
    let backend = ScriptedBackend::echo();
    register(&engine, limited, &backend);
    // Load the tokenizer before the clock matters
    switchboard::tokens::count_tokens("warm up");

    // Spend the whole bucket; one token frees up per second
    for i in 0..LIMIT {
        engine
            .complete(
                LlmRequest::completion(format!("warm {}", i)),
                CompleteOptions::default(),
            )
            .await
            .unwrap();
    }
    let switchboard = start(engine, None).await;

    let id = switchboard
        .enqueue(LlmRequest::completion("over the limit"), Priority::Normal)
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let retrying = loop {
        let status = switchboard.status(id).unwrap();
        if status.state == TaskState::Retrying {
            break status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task never backed off, state {:?}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(retrying.next_run_at.is_some());
    assert!(retrying.error.unwrap().contains("Rate limit exceeded"));

    let status = wait_for_task(&switchboard, id).await;
    assert_eq!(status.state, TaskState::Completed);
    assert!(status.runs >= 2);
    assert_eq!(status.result.unwrap().response.content, "over the limit");
    assert_eq!(backend.calls(), LIMIT + 1);

    switchboard.shutdown().await;
}
