//! Anthropic messages API mock

#![allow(dead_code)]

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn messages_body(model: &str, text: &str) -> Value {
    json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 20, "output_tokens": 7}
    })
}

pub async fn mock_messages(server: &MockServer, model: &str, text: &str) {
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_body(model, text)))
        .mount(server)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use switchboard::backend::Backend;
    use switchboard::error::ProviderError;
    use switchboard::registry::{Endpoint, EndpointKind, ModelConfig};
    use switchboard::{LlmRequest, Message};
    use wiremock::matchers::body_partial_json;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn backend(server: &MockServer) -> Backend {
        let endpoint = Endpoint {
            kind: EndpointKind::Anthropic,
            base_url: server.uri(),
            api_key_env: None,
        };
        Backend::from_endpoint(&endpoint, reqwest::Client::new()).unwrap()
    }

    #[tokio::test]
    async fn test_system_prompt_is_lifted_out_of_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({
                "system": "Be terse.",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(messages_body("claude-3-haiku", "Hey.")),
            )
            .expect(1)
            .mount(&server)
            .await;
        let config = ModelConfig::new("anthropic", "claude-3-haiku");
        let request = LlmRequest::chat(vec![Message::system("Be terse."), Message::user("Hi")]);

        let invocation = backend(&server)
            .invoke(&config, &request, DEADLINE)
            .await
            .unwrap();

        assert_eq!(invocation.response.content, "Hey.");
        assert_eq!(invocation.tokens_in, 20);
        assert_eq!(invocation.tokens_out, 7);
    }

    #[tokio::test]
    async fn test_max_tokens_defaults_to_model_limit() {
        let server = MockServer::start().await;
        let mut config = ModelConfig::new("anthropic", "claude-3-haiku");
        config.max_output_tokens = 512;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({"max_tokens": 512})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(messages_body("claude-3-haiku", "ok")),
            )
            .expect(1)
            .mount(&server)
            .await;

        backend(&server)
            .invoke(&config, &LlmRequest::completion("hello"), DEADLINE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_embeddings_are_rejected_without_a_call() {
        let server = MockServer::start().await;
        let config = ModelConfig::new("anthropic", "claude-3-haiku");

        let err = backend(&server)
            .invoke(&config, &LlmRequest::embedding("vectorize"), DEADLINE)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Unknown(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
