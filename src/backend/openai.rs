//! OpenAI-compatible HTTP backend
//!
//! Speaks `/chat/completions`, `/completions` and `/embeddings`, which
//! covers OpenAI itself and the many servers that mimic its API.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use super::{read_json, Invocation};
use crate::error::ProviderError;
use crate::registry::ModelConfig;
use crate::tokens;
use crate::types::{LlmRequest, LlmResponse, RequestKind};

/// Request parameters that must not be forwarded
const RESERVED_PARAMETERS: &[&str] = &["model", "messages", "prompt", "input", "stream"];

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingData {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    #[serde(default)]
    pub model: Option<String>,
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl OpenAiBackend {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn body(config: &ModelConfig, request: &LlmRequest) -> Map<String, Value> {
        let mut body = Map::new();
        for (name, value) in &request.parameters {
            if !RESERVED_PARAMETERS.contains(&name.as_str()) {
                body.insert(name.clone(), value.clone());
            }
        }
        body.insert("model".into(), json!(config.name));
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        body
    }

    #[instrument(skip_all, fields(model = %config.name, kind = %request.kind))]
    pub async fn invoke(
        &self,
        config: &ModelConfig,
        request: &LlmRequest,
    ) -> Result<Invocation, ProviderError> {
        match request.kind {
            RequestKind::Chat => {
                let mut body = Self::body(config, request);
                let messages: Vec<Value> = request
                    .messages
                    .iter()
                    .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                    .collect();
                body.insert("messages".into(), Value::Array(messages));
                let parsed: CompletionResponse =
                    read_json(self.post("/chat/completions").json(&body).send().await?).await?;
                Self::completion(config, request, parsed, |c| {
                    c.message.as_ref().and_then(|m| m.content.clone())
                })
            }
            RequestKind::Completion => {
                let mut body = Self::body(config, request);
                body.insert("prompt".into(), json!(request.prompt.clone().unwrap_or_default()));
                let parsed: CompletionResponse =
                    read_json(self.post("/completions").json(&body).send().await?).await?;
                Self::completion(config, request, parsed, |c| c.text.clone())
            }
            RequestKind::Embedding => {
                let input = request.prompt.clone().unwrap_or_else(|| request.text());
                let embedding = self.embed(&config.name, &input).await?;
                let tokens_in = embedding
                    .usage
                    .as_ref()
                    .map(|u| u.prompt_tokens)
                    .unwrap_or_else(|| tokens::count_tokens(&input) as u32);
                let vector = embedding
                    .data
                    .into_iter()
                    .next()
                    .map(|d| d.embedding)
                    .ok_or_else(|| ProviderError::InvalidResponse("no embedding returned".into()))?;
                Ok(Invocation {
                    response: LlmResponse {
                        content: String::new(),
                        embedding: Some(vector),
                        model: embedding.model.unwrap_or_else(|| config.name.clone()),
                        finish_reason: None,
                    },
                    tokens_in,
                    tokens_out: 0,
                })
            }
        }
    }

    /// Raw `/embeddings` call
    pub(crate) async fn embed(
        &self,
        model: &str,
        input: &str,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let body = json!({"model": model, "input": input});
        debug!(model = %model, input_len = input.len(), "Requesting embedding");
        read_json(self.post("/embeddings").json(&body).send().await?).await
    }

    fn completion(
        config: &ModelConfig,
        request: &LlmRequest,
        parsed: CompletionResponse,
        content: impl Fn(&Choice) -> Option<String>,
    ) -> Result<Invocation, ProviderError> {
        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".into()))?;
        let text = content(choice)
            .ok_or_else(|| ProviderError::InvalidResponse("choice has no content".into()))?;

        let (tokens_in, tokens_out) = match &parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                tokens::count_request_tokens(request) as u32,
                tokens::count_tokens(&text) as u32,
            ),
        };

        Ok(Invocation {
            response: LlmResponse {
                content: text,
                embedding: None,
                model: parsed.model.clone().unwrap_or_else(|| config.name.clone()),
                finish_reason: choice.finish_reason.clone(),
            },
            tokens_in,
            tokens_out,
        })
    }
}
