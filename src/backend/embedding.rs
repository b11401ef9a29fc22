//! Embedding collaborator for the semantic cache

use async_trait::async_trait;

use super::OpenAiBackend;
use crate::error::ProviderError;

/// Turns request text into a vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint
pub struct OpenAiEmbedder {
    backend: OpenAiBackend,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            backend: OpenAiBackend::new(client, base_url.trim_end_matches('/').to_string(), api_key),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self.backend.embed(&self.model, text).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("no embedding returned".into()))
    }
}
