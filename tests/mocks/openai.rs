//! OpenAI-compatible provider mock
//!
//! Wiremock responders for `/chat/completions`, `/completions` and
//! `/embeddings`, plus tests of the HTTP backend against them.

#![allow(dead_code)]

use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Chat completion response body in the OpenAI shape
pub fn chat_completion_body(model: &str, content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1706745600,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
    })
}

pub async fn mock_chat_completion(server: &MockServer, model: &str, content: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": model})))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body(model, content)))
        .mount(server)
        .await;
}

pub async fn mock_text_completion(server: &MockServer, model: &str, text: &str) {
    Mock::given(method("POST"))
        .and(path("/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": model,
            "choices": [{"index": 0, "text": text, "finish_reason": "length"}]
        })))
        .mount(server)
        .await;
}

pub async fn mock_embeddings(server: &MockServer, vector: &[f32]) {
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "model": "text-embedding-3-small",
            "data": [{"object": "embedding", "index": 0, "embedding": vector}],
            "usage": {"prompt_tokens": 4, "total_tokens": 4}
        })))
        .mount(server)
        .await;
}

/// Any POST answers with `status` and an OpenAI-style error body
pub async fn mock_error(server: &MockServer, status: u16, retry_after: Option<&str>) {
    let mut template = ResponseTemplate::new(status).set_body_json(json!({
        "error": {"message": "mocked failure", "type": "server_error"}
    }));
    if let Some(secs) = retry_after {
        template = template.insert_header("retry-after", secs);
    }
    Mock::given(method("POST"))
        .respond_with(template)
        .mount(server)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use switchboard::backend::{Backend, Embedder, OpenAiEmbedder};
    use switchboard::error::ProviderError;
    use switchboard::registry::{Endpoint, EndpointKind, ModelConfig};
    use switchboard::{LlmRequest, Message};

    fn backend(server: &MockServer) -> Backend {
        let endpoint = Endpoint {
            kind: EndpointKind::OpenAi,
            base_url: format!("{}/", server.uri()),
            api_key_env: None,
        };
        Backend::from_endpoint(&endpoint, reqwest::Client::new()).unwrap()
    }

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_chat_completion_reports_provider_usage() {
        let server = MockServer::start().await;
        mock_chat_completion(&server, "gpt-4o-mini", "Hello!").await;
        let config = ModelConfig::new("openai", "gpt-4o-mini");

        let invocation = backend(&server)
            .invoke(&config, &LlmRequest::chat(vec![Message::user("Hi")]), DEADLINE)
            .await
            .unwrap();

        assert_eq!(invocation.response.content, "Hello!");
        assert_eq!(invocation.response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(invocation.tokens_in, 12);
        assert_eq!(invocation.tokens_out, 5);
    }

    #[tokio::test]
    async fn test_text_completion_without_usage_estimates_tokens() {
        let server = MockServer::start().await;
        mock_text_completion(&server, "gpt-3.5-turbo-instruct", "four").await;
        let config = ModelConfig::new("openai", "gpt-3.5-turbo-instruct");

        let invocation = backend(&server)
            .invoke(&config, &LlmRequest::completion("two plus two is"), DEADLINE)
            .await
            .unwrap();

        assert_eq!(invocation.response.content, "four");
        assert!(invocation.tokens_in > 0);
        assert!(invocation.tokens_out > 0);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_provider_errors() {
        let config = ModelConfig::new("openai", "gpt-4o");
        let request = LlmRequest::completion("x");

        let server = MockServer::start().await;
        mock_error(&server, 429, Some("2")).await;
        let err = backend(&server)
            .invoke(&config, &request, DEADLINE)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );

        let server = MockServer::start().await;
        mock_error(&server, 401, None).await;
        let err = backend(&server)
            .invoke(&config, &request, DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));

        let server = MockServer::start().await;
        mock_error(&server, 500, None).await;
        let err = backend(&server)
            .invoke(&config, &request, DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unknown(ref msg) if msg.starts_with("HTTP 500")));
    }

    #[tokio::test]
    async fn test_slow_provider_hits_the_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_completion_body("gpt-4o", "late"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        let config = ModelConfig::new("openai", "gpt-4o");

        let err = backend(&server)
            .invoke(
                &config,
                &LlmRequest::chat(vec![Message::user("Hi")]),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_embedder_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.25, 0.5, 0.75]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(
            reqwest::Client::new(),
            server.uri(),
            Some("test-api-key".to_string()),
            "text-embedding-3-small",
        );
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.25, 0.5, 0.75]);
    }
}
