//! End-to-end routing over mocked HTTP providers

use std::sync::Arc;
use std::time::Duration;

use switchboard::backend::OpenAiEmbedder;
use switchboard::balancer::{LoadBalancingRule, RuleBook, Strategy};
use switchboard::cache::CacheConfig;
use switchboard::registry::{Endpoint, EndpointKind, ModelConfig};
use switchboard::{CompleteOptions, Engine, LlmRequest, Message};
use wiremock::MockServer;

use crate::common::{fast_engine_config, test_engine};
use crate::mocks::{mock_chat_completion, mock_embeddings, mock_error, mock_messages};

fn remote(provider: &str, name: &str, kind: EndpointKind, server: &MockServer, priority: u32) -> ModelConfig {
    let mut config = ModelConfig::new(provider, name);
    config.priority = priority;
    config.input_cost_per_1k = 1.0;
    config.output_cost_per_1k = 2.0;
    config.endpoint = Some(Endpoint {
        kind,
        base_url: server.uri(),
        api_key_env: None,
    });
    config
}

#[tokio::test]
async fn test_openai_failure_fails_over_to_anthropic() {
    let openai = MockServer::start().await;
    let anthropic = MockServer::start().await;
    mock_error(&openai, 503, None).await;
    mock_messages(&anthropic, "claude-3-haiku", "Bonjour").await;

    let engine = test_engine(RuleBook::default());
    engine
        .register_endpoint_model(remote("openai", "gpt-4o", EndpointKind::OpenAi, &openai, 10))
        .unwrap();
    engine
        .register_endpoint_model(remote(
            "anthropic",
            "claude-3-haiku",
            EndpointKind::Anthropic,
            &anthropic,
            1,
        ))
        .unwrap();

    let completion = engine
        .complete(
            LlmRequest::chat(vec![Message::user("Say hello in French")]),
            CompleteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(completion.model, "anthropic/claude-3-haiku");
    assert_eq!(completion.response.content, "Bonjour");
    assert_eq!(completion.attempts, 2);
    // Provider-reported usage priced at 1.0 in / 2.0 out per 1K
    assert_eq!(completion.tokens_in, 20);
    assert_eq!(completion.tokens_out, 7);
    assert!((completion.cost - 0.034).abs() < 1e-9);

    let stats = engine
        .metrics("openai/gpt-4o", Duration::from_secs(60))
        .unwrap();
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn test_cost_optimized_rule_prefers_cheaper_model() {
    let cheap = MockServer::start().await;
    let pricey = MockServer::start().await;
    mock_chat_completion(&cheap, "gpt-4o-mini", "cheap answer").await;
    mock_chat_completion(&pricey, "gpt-4o", "pricey answer").await;

    let rule = LoadBalancingRule::new("budget", Strategy::CostOptimized);
    let engine = test_engine(RuleBook::single(rule).unwrap());
    let mut expensive = remote("openai", "gpt-4o", EndpointKind::OpenAi, &pricey, 10);
    expensive.input_cost_per_1k = 5.0;
    expensive.output_cost_per_1k = 15.0;
    let mut inexpensive = remote("openai", "gpt-4o-mini", EndpointKind::OpenAi, &cheap, 0);
    inexpensive.input_cost_per_1k = 0.15;
    inexpensive.output_cost_per_1k = 0.6;
    engine.register_endpoint_model(expensive).unwrap();
    engine.register_endpoint_model(inexpensive).unwrap();

    let completion = engine
        .complete(
            LlmRequest::chat(vec![Message::user("Hi")]),
            CompleteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(completion.model, "openai/gpt-4o-mini");
    assert_eq!(completion.response.content, "cheap answer");
}

#[tokio::test]
async fn test_semantic_cache_with_http_embedder() {
    let provider = MockServer::start().await;
    let embeddings = MockServer::start().await;
    mock_chat_completion(&provider, "gpt-4o", "It is Paris.").await;
    // Every text embeds to the same vector, so any same-kind request matches
    mock_embeddings(&embeddings, &[0.3, 0.4, 0.5]).await;

    let mut config = fast_engine_config();
    config.cache = CacheConfig {
        similarity_threshold: Some(0.95),
        ..CacheConfig::default()
    };
    let embedder = OpenAiEmbedder::new(
        reqwest::Client::new(),
        embeddings.uri(),
        None,
        "text-embedding-3-small",
    );
    let engine = Arc::new(Engine::new(config, RuleBook::default(), Some(Arc::new(embedder))));
    engine
        .register_endpoint_model(remote("openai", "gpt-4o", EndpointKind::OpenAi, &provider, 0))
        .unwrap();

    let first = engine
        .complete(
            LlmRequest::chat(vec![Message::user("Capital of France?")]),
            CompleteOptions::default(),
        )
        .await
        .unwrap();
    let second = engine
        .complete(
            LlmRequest::chat(vec![Message::user("What's France's capital?")]),
            CompleteOptions::default(),
        )
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert!(second.similarity.unwrap() > 0.99);
    assert_eq!(provider.received_requests().await.unwrap().len(), 1);
}
