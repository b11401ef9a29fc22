//! Anthropic messages API backend
//!
//! System messages move to the top-level `system` field. Strict
//! user/assistant alternation is left to the caller.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::instrument;

use super::{read_json, Invocation};
use crate::error::ProviderError;
use crate::registry::ModelConfig;
use crate::types::{LlmRequest, LlmResponse, Message, RequestKind, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

/// Split system messages from the conversation
fn extract_system_prompt(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let (system, rest): (Vec<&Message>, Vec<&Message>) =
        messages.iter().partition(|m| m.role == Role::System);
    let system_prompt = if system.is_empty() {
        None
    } else {
        Some(
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    };
    (system_prompt, rest)
}

impl AnthropicBackend {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn body(config: &ModelConfig, request: &LlmRequest) -> Result<Map<String, Value>, ProviderError> {
        let mut body = Map::new();
        let messages: Vec<Value> = match request.kind {
            RequestKind::Chat => {
                let (system, rest) = extract_system_prompt(&request.messages);
                if let Some(system) = system {
                    body.insert("system".into(), json!(system));
                }
                rest.iter()
                    .map(|m| {
                        // Anthropic has no tool role outside tool_result blocks
                        let role = match m.role {
                            Role::Assistant => "assistant",
                            _ => "user",
                        };
                        json!({"role": role, "content": m.content})
                    })
                    .collect()
            }
            RequestKind::Completion => {
                vec![json!({"role": "user", "content": request.prompt.clone().unwrap_or_default()})]
            }
            RequestKind::Embedding => {
                return Err(ProviderError::Unknown(
                    "embeddings are not supported by the messages API".into(),
                ))
            }
        };

        body.insert("model".into(), json!(config.name));
        body.insert(
            "max_tokens".into(),
            json!(request.max_tokens.unwrap_or(config.max_output_tokens)),
        );
        if let Some(temperature) = request.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        body.insert("messages".into(), Value::Array(messages));
        Ok(body)
    }

    #[instrument(skip_all, fields(model = %config.name, kind = %request.kind))]
    pub async fn invoke(
        &self,
        config: &ModelConfig,
        request: &LlmRequest,
    ) -> Result<Invocation, ProviderError> {
        let body = Self::body(config, request)?;

        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let parsed: MessagesResponse = read_json(builder.send().await?).await?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        Ok(Invocation {
            response: LlmResponse {
                content: text,
                embedding: None,
                model: parsed.model.unwrap_or_else(|| config.name.clone()),
                finish_reason: parsed.stop_reason,
            },
            tokens_in: parsed.usage.input_tokens,
            tokens_out: parsed.usage.output_tokens,
        })
    }
}
