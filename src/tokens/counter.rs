//! Token estimation
//!
//! Uses tiktoken-rs with the `cl100k_base` encoding as a provider-neutral
//! estimate. Routing only needs an estimate (context window checks, cost
//! ordering), and backends that report usage override it.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::types::{LlmRequest, RequestKind};

/// Shared encoder; `None` if the BPE tables failed to load
static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!(error = %e, "Failed to load cl100k_base, estimating tokens from length");
        None
    }
});

/// Token overhead per chat message: <|start|>{role}\n{content}<|end|>\n
const TOKENS_PER_MESSAGE: usize = 3;
/// Every reply is primed with <|start|>assistant<|message|>
const REPLY_PRIMING: usize = 3;

/// Count tokens in a text string
pub fn count_tokens(text: &str) -> usize {
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Estimated prompt tokens of a request
pub fn count_request_tokens(request: &LlmRequest) -> usize {
    match request.kind {
        RequestKind::Chat => {
            let messages: usize = request
                .messages
                .iter()
                .map(|m| TOKENS_PER_MESSAGE + count_tokens(m.role.as_str()) + count_tokens(&m.content))
                .sum();
            messages + REPLY_PRIMING
        }
        RequestKind::Completion | RequestKind::Embedding => {
            request.prompt.as_deref().map(count_tokens).unwrap_or(0)
        }
    }
}

/// Output tokens assumed when the caller gives no `max_tokens`
pub const DEFAULT_EXPECTED_OUTPUT: u32 = 256;

/// Expected completion tokens of a request
pub fn expected_output_tokens(request: &LlmRequest) -> u32 {
    match request.kind {
        RequestKind::Embedding => 0,
        _ => request.max_tokens.unwrap_or(DEFAULT_EXPECTED_OUTPUT),
    }
}
