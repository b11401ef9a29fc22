//! Backend call interface
//!
//! `Backend` is the closed set of provider kinds the engine can invoke.
//! Every variant answers the same `invoke` call; the executor never
//! inspects which one it holds.

mod anthropic;
mod embedding;
mod openai;
#[cfg(any(test, feature = "test-utils"))]
mod scripted;

pub use anthropic::AnthropicBackend;
pub use embedding::{Embedder, OpenAiEmbedder};
pub use openai::OpenAiBackend;
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{Reply, ScriptedBackend, StaticEmbedder};

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{EngineError, EngineResult, ProviderError};
use crate::registry::{Endpoint, EndpointKind, ModelConfig};
use crate::types::{LlmRequest, LlmResponse};

/// Successful backend call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub response: LlmResponse,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// A callable backend
pub enum Backend {
    OpenAi(OpenAiBackend),
    Anthropic(AnthropicBackend),
    #[cfg(any(test, feature = "test-utils"))]
    Scripted(ScriptedBackend),
}

impl Backend {
    /// Build an HTTP backend from a catalog endpoint
    ///
    /// Fails with `Configuration` when the endpoint names an API key
    /// variable that is not set.
    pub fn from_endpoint(endpoint: &Endpoint, client: reqwest::Client) -> EngineResult<Self> {
        let api_key = match &endpoint.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                EngineError::Configuration(format!(
                    "environment variable {} for {} is not set",
                    var, endpoint.base_url
                ))
            })?),
            None => None,
        };
        let base_url = endpoint.base_url.trim_end_matches('/').to_string();

        Ok(match endpoint.kind {
            EndpointKind::OpenAi => Backend::OpenAi(OpenAiBackend::new(client, base_url, api_key)),
            EndpointKind::Anthropic => {
                Backend::Anthropic(AnthropicBackend::new(client, base_url, api_key))
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::OpenAi(_) => "openai",
            Backend::Anthropic(_) => "anthropic",
            #[cfg(any(test, feature = "test-utils"))]
            Backend::Scripted(_) => "scripted",
        }
    }

    /// Call the backend, giving up after `deadline`
    pub async fn invoke(
        &self,
        config: &ModelConfig,
        request: &LlmRequest,
        deadline: Duration,
    ) -> Result<Invocation, ProviderError> {
        let call = async {
            match self {
                Backend::OpenAi(b) => b.invoke(config, request).await,
                Backend::Anthropic(b) => b.invoke(config, request).await,
                #[cfg(any(test, feature = "test-utils"))]
                Backend::Scripted(b) => b.invoke(config, request).await,
            }
        };

        match tokio::time::timeout(deadline, call).await {
            Ok(Err(ProviderError::Timeout(_))) | Err(_) => Err(ProviderError::Timeout(deadline)),
            Ok(result) => result,
        }
    }
}

/// Map a non-success HTTP status to the provider error taxonomy
pub(crate) fn error_for_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    debug!(status = %status, body_len = body.len(), "Backend returned error status");
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(truncate(body)),
        429 => ProviderError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        408 | 504 => ProviderError::Timeout(Duration::ZERO),
        _ => ProviderError::Unknown(format!("HTTP {}: {}", status.as_u16(), truncate(body))),
    }
}

/// `Retry-After` in seconds; HTTP dates are not supported
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn truncate(body: &str) -> String {
    body.chars().take(256).collect()
}

/// Read a response body as JSON, mapping failures to the provider taxonomy
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(error_for_status(status, &headers, &text));
    }
    serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}
