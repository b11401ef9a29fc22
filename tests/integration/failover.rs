//! Failover, exhaustion and local limits
//!
//! Candidates are tried in rule order. Provider failures count against a
//! model's health; local rate limits and busy slots only move the request
//! to the next candidate.

use std::time::Duration;

use futures::future::join_all;

use switchboard::backend::{Reply, ScriptedBackend};
use switchboard::balancer::{LoadBalancingRule, RuleBook, Strategy};
use switchboard::error::{AttemptError, ProviderError};
use switchboard::executor::cancellation;
use switchboard::{CompleteOptions, EngineError, LlmRequest};

use crate::common::{model, model_with_priority, register, test_engine};

const WINDOW: Duration = Duration::from_secs(60);

fn unavailable() -> ProviderError {
    ProviderError::Unknown("HTTP 503: upstream unavailable".into())
}

#[tokio::test]
async fn test_failover_to_next_candidate() {
    let engine = test_engine(RuleBook::default());
    let broken = ScriptedBackend::failing(unavailable());
    let healthy = ScriptedBackend::text("from b");
    let a = register(&engine, model_with_priority("a", 10), &broken);
    let b = register(&engine, model_with_priority("b", 1), &healthy);

    let completion = engine
        .complete(LlmRequest::completion("hello"), CompleteOptions::default())
        .await
        .unwrap();

    assert_eq!(completion.model, b);
    assert_eq!(completion.response.content, "from b");
    assert_eq!(completion.attempts, 2);
    assert_eq!(broken.calls(), 1);

    let stats = engine.metrics(&a, WINDOW).unwrap();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.errors, 1);
    let stats = engine.metrics(&b, WINDOW).unwrap();
    assert_eq!(stats.successes, 1);
}

#[tokio::test]
async fn test_every_call_fails_over_while_health_drops() {
    const CALLS: usize = 25;
    let engine = test_engine(RuleBook::default());
    let broken = ScriptedBackend::failing(unavailable());
    let healthy = ScriptedBackend::text("from b");
    let a = register(&engine, model_with_priority("a", 10), &broken);
    let b = register(&engine, model_with_priority("b", 1), &healthy);

    for i in 0..CALLS {
        let completion = engine
            .complete(
                LlmRequest::completion(format!("question {}", i)),
                CompleteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(completion.model, b, "call {} was not served by b", i);
        assert_eq!(completion.response.content, "from b");
        assert_eq!(completion.attempts, 2);
    }

    assert_eq!(broken.calls(), CALLS as u32);
    assert_eq!(healthy.calls(), CALLS as u32);
    let stats = engine.metrics(&a, WINDOW).unwrap();
    assert_eq!(stats.errors, CALLS as u64);
    // Past min_samples the error spike is flagged, but a stays routable
    assert!(!stats.anomalies.is_empty());
    assert!(stats.health < 60.0);
    assert_eq!(engine.metrics(&b, WINDOW).unwrap().successes, CALLS as u64);
}

#[tokio::test]
async fn test_exhaustion_after_every_candidate_fails() {
    let rule = LoadBalancingRule::new("pair", Strategy::Priority).with_pool(["test/a", "test/b"]);
    let engine = test_engine(RuleBook::single(rule).unwrap());
    let first = ScriptedBackend::failing(unavailable());
    let second = ScriptedBackend::failing(ProviderError::Auth("bad key".into()));
    register(&engine, model_with_priority("a", 5), &first);
    register(&engine, model_with_priority("b", 1), &second);

    let err = engine
        .complete(LlmRequest::completion("hello"), CompleteOptions::default())
        .await
        .unwrap_err();

    match err {
        EngineError::ExhaustedRetries {
            attempts,
            ref last_error,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(
                *last_error,
                AttemptError::Provider(ProviderError::Auth("bad key".into()))
            );
        }
        other => panic!("expected ExhaustedRetries, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn test_transient_failure_then_success_on_same_model() {
    let engine = test_engine(RuleBook::default());
    let flaky = ScriptedBackend::text("second time lucky").then(Reply::Fail(unavailable()));
    register(&engine, model("a"), &flaky);

    let err = engine
        .complete(LlmRequest::completion("retry me"), CompleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExhaustedRetries { attempts: 1, .. }));

    let completion = engine
        .complete(LlmRequest::completion("retry me"), CompleteOptions::default())
        .await
        .unwrap();
    assert_eq!(completion.response.content, "second time lucky");
    assert!(!completion.cached);
}

#[tokio::test]
async fn test_rate_limited_model_is_skipped_not_penalized() {
    let engine = test_engine(RuleBook::default());
    let mut limited = model_with_priority("a", 10);
    limited.rate_limit_per_minute = Some(1);
    let a_backend = ScriptedBackend::echo();
    let b_backend = ScriptedBackend::echo();
    let a = register(&engine, limited, &a_backend);
    let b = register(&engine, model_with_priority("b", 1), &b_backend);

    let first = engine
        .complete(LlmRequest::completion("one"), CompleteOptions::default())
        .await
        .unwrap();
    assert_eq!(first.model, a);

    let second = engine
        .complete(LlmRequest::completion("two"), CompleteOptions::default())
        .await
        .unwrap();
    assert_eq!(second.model, b);
    assert_eq!(a_backend.calls(), 1);

    let stats = engine.metrics(&a, WINDOW).unwrap();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.timeouts, 0);
    assert!(engine.registry().contains(&a));
}

#[tokio::test]
async fn test_rate_limit_on_sole_model_reports_retry_after() {
    let engine = test_engine(RuleBook::default());
    let mut limited = model("only");
    limited.rate_limit_per_minute = Some(1);
    let id = register(&engine, limited, &ScriptedBackend::echo());

    engine
        .complete(LlmRequest::completion("one"), CompleteOptions::default())
        .await
        .unwrap();
    let err = engine
        .complete(LlmRequest::completion("two"), CompleteOptions::default())
        .await
        .unwrap_err();

    match err {
        EngineError::RateLimited { model, retry_after } => {
            assert_eq!(model, id);
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
async fn test_burst_over_the_limit_is_answered_or_rejected() {
    const LIMIT: u32 = 5;
    let engine = test_engine(RuleBook::default());
    let mut limited = model("only");
    limited.rate_limit_per_minute = Some(LIMIT);
    let backend = ScriptedBackend::echo();
    let id = register(&engine, limited, &backend);

    let issued = 2 * LIMIT as usize;
    let results = join_all((0..issued).map(|i| {
        let engine = engine.clone();
        async move {
            engine
                .complete(
                    LlmRequest::completion(format!("burst {}", i)),
                    CompleteOptions::default(),
                )
                .await
        }
    }))
    .await;

    let mut answered = 0;
    let mut rejected = 0;
    for result in results {
        match result {
            Ok(_) => answered += 1,
            Err(EngineError::RateLimited { model, .. }) => {
                assert_eq!(model, id);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(answered + rejected, issued);
    assert_eq!(answered, LIMIT as usize);
    assert_eq!(backend.calls(), LIMIT);
}

#[tokio::test]
async fn test_busy_model_fails_over() {
    let engine = test_engine(RuleBook::default());
    let mut single_slot = model_with_priority("a", 10);
    single_slot.concurrency_limit = 1;
    let slow = ScriptedBackend::text("slow").with_latency(Duration::from_millis(300));
    let spare = ScriptedBackend::text("spare");
    let a = register(&engine, single_slot, &slow);
    let b = register(&engine, model_with_priority("b", 1), &spare);

    let busy = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .complete(LlmRequest::completion("long"), CompleteOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = engine
        .complete(LlmRequest::completion("short"), CompleteOptions::default())
        .await
        .unwrap();
    assert_eq!(second.model, b);

    let first = busy.await.unwrap().unwrap();
    assert_eq!(first.model, a);
    assert_eq!(slow.calls(), 1);
    assert_eq!(engine.metrics(&a, WINDOW).unwrap().errors, 0);
}

#[tokio::test]
async fn test_deadline_expiry_counts_as_timeout() {
    let engine = test_engine(RuleBook::default());
    let slow = ScriptedBackend::text("late").with_latency(Duration::from_millis(300));
    let id = register(&engine, model("a"), &slow);

    let err = engine
        .complete(
            LlmRequest::completion("hurry"),
            CompleteOptions::default().with_deadline(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::ExhaustedRetries { last_error, .. } => assert!(last_error.is_timeout()),
        other => panic!("expected ExhaustedRetries, got {:?}", other),
    }
    let stats = engine.metrics(&id, WINDOW).unwrap();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn test_cancellation_stops_the_attempt() {
    let engine = test_engine(RuleBook::default());
    let slow = ScriptedBackend::text("never").with_latency(Duration::from_secs(5));
    let id = register(&engine, model("a"), &slow);
    let (handle, signal) = cancellation();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let started = std::time::Instant::now();
    let err = engine
        .complete(
            LlmRequest::completion("cancel me"),
            CompleteOptions::default().with_cancel(signal),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        err,
        EngineError::ExhaustedRetries {
            last_error: AttemptError::Cancelled,
            ..
        }
    ));
    // Caller cancellation says nothing about the model
    let stats = engine.metrics(&id, WINDOW).unwrap();
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.errors, 0);
}
