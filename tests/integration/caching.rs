//! Cache behavior through the synchronous path
//!
//! Exact hits, semantic hits around the threshold, TTL expiry and
//! administrative invalidation.

use std::sync::Arc;
use std::time::Duration;

use switchboard::backend::{ScriptedBackend, StaticEmbedder};
use switchboard::balancer::RuleBook;
use switchboard::cache::{CacheConfig, CacheFilter};
use switchboard::{CompleteOptions, LlmRequest, Message};

use crate::common::{fast_engine_config, model, register, test_engine, test_engine_with_embedder};

#[tokio::test]
async fn test_identical_requests_call_backend_once() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::text("Paris");
    register(&engine, model("a"), &backend);

    let request = LlmRequest::chat(vec![
        Message::system("Answer briefly."),
        Message::user("What is the capital of France?"),
    ]);
    let first = engine
        .complete(request.clone(), CompleteOptions::default())
        .await
        .unwrap();
    // Whitespace and metadata do not change the cache key
    let second = engine
        .complete(
            LlmRequest::chat(vec![
                Message::system("  Answer   briefly. "),
                Message::user("What is the capital of France?"),
            ])
            .with_metadata("trace", "abc"),
            CompleteOptions::default(),
        )
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.response.content, "Paris");
    assert_eq!(second.model, first.model);
    assert_eq!(second.attempts, 0);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_different_parameters_miss_the_cache() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::echo();
    register(&engine, model("a"), &backend);

    engine
        .complete(LlmRequest::completion("hello"), CompleteOptions::default())
        .await
        .unwrap();
    let second = engine
        .complete(
            LlmRequest::completion("hello").with_temperature(0.9),
            CompleteOptions::default(),
        )
        .await
        .unwrap();

    assert!(!second.cached);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_semantic_hit_above_threshold_and_miss_below() {
    let original = "What is the capital of France?";
    let close = "Tell me France's capital city";
    let distant = "Which city hosts the French government?";
    let embedder = StaticEmbedder::new()
        .with(original, vec![1.0, 0.0])
        .with(close, vec![0.9, (1.0f32 - 0.81).sqrt()])
        .with(distant, vec![0.7, (1.0f32 - 0.49).sqrt()]);

    let mut config = fast_engine_config();
    config.cache = CacheConfig {
        similarity_threshold: Some(0.85),
        ..CacheConfig::default()
    };
    let engine = test_engine_with_embedder(config, RuleBook::default(), Arc::new(embedder));
    let backend = ScriptedBackend::text("Paris");
    register(&engine, model("a"), &backend);

    engine
        .complete(LlmRequest::completion(original), CompleteOptions::default())
        .await
        .unwrap();

    let near = engine
        .complete(LlmRequest::completion(close), CompleteOptions::default())
        .await
        .unwrap();
    assert!(near.cached);
    let similarity = near.similarity.expect("Semantic hit reports similarity");
    assert!((similarity - 0.9).abs() < 1e-3, "similarity {}", similarity);
    assert_eq!(backend.calls(), 1);

    let far = engine
        .complete(LlmRequest::completion(distant), CompleteOptions::default())
        .await
        .unwrap();
    assert!(!far.cached);
    assert!(far.similarity.is_none());
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_semantic_match_requires_same_kind() {
    let text = "Summarize the plot of Hamlet";
    let embedder = StaticEmbedder::new().with(text, vec![0.6, 0.8]);
    let engine = test_engine_with_embedder(
        fast_engine_config(),
        RuleBook::default(),
        Arc::new(embedder),
    );
    let backend = ScriptedBackend::text("A prince hesitates.");
    register(&engine, model("a"), &backend);

    let options = CompleteOptions::default().with_similarity_threshold(0.5);
    engine
        .complete(LlmRequest::completion(text), options.clone())
        .await
        .unwrap();
    let chat = engine
        .complete(LlmRequest::chat(vec![Message::user(text)]), options)
        .await
        .unwrap();

    assert!(!chat.cached);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::text("fresh");
    register(&engine, model("a"), &backend);
    let options = CompleteOptions::default().with_cache_ttl(Duration::from_secs(1));

    engine
        .complete(LlmRequest::completion("ttl"), options.clone())
        .await
        .unwrap();
    let within = engine
        .complete(LlmRequest::completion("ttl"), options.clone())
        .await
        .unwrap();
    assert!(within.cached);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let after = engine
        .complete(LlmRequest::completion("ttl"), options)
        .await
        .unwrap();
    assert!(!after.cached);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_skip_cache_neither_reads_nor_writes() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::text("uncached");
    register(&engine, model("a"), &backend);

    for _ in 0..2 {
        let completion = engine
            .complete(
                LlmRequest::completion("no cache"),
                CompleteOptions::default().without_cache(),
            )
            .await
            .unwrap();
        assert!(!completion.cached);
    }

    assert_eq!(backend.calls(), 2);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn test_invalidate_by_model() {
    let engine = test_engine(RuleBook::default());
    let backend = ScriptedBackend::echo();
    let id = register(&engine, model("a"), &backend);

    engine
        .complete(LlmRequest::completion("one"), CompleteOptions::default())
        .await
        .unwrap();
    engine
        .complete(LlmRequest::completion("two"), CompleteOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.cache().len(), 2);

    let other = CacheFilter {
        model: Some("test/other".into()),
        ..CacheFilter::default()
    };
    assert_eq!(engine.invalidate_cache_matching(&other), 0);

    let filter = CacheFilter {
        model: Some(id),
        ..CacheFilter::default()
    };
    assert_eq!(engine.invalidate_cache_matching(&filter), 2);
    assert!(engine.cache().is_empty());

    let again = engine
        .complete(LlmRequest::completion("one"), CompleteOptions::default())
        .await
        .unwrap();
    assert!(!again.cached);
    assert_eq!(backend.calls(), 3);
}
