//! Request normalisation and cache key derivation

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{LlmRequest, RequestKind, Role};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Parameters that never influence the answer
const VOLATILE_PARAMETERS: &[&str] = &["stream", "user", "request_id", "idempotency_key", "timestamp"];

#[derive(Serialize)]
struct NormalizedMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct NormalizedRequest<'a> {
    kind: RequestKind,
    messages: Vec<NormalizedMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    parameters: BTreeMap<&'a str, &'a serde_json::Value>,
}

/// Trim and collapse runs of whitespace to a single space
pub fn normalize_text(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn role_str(role: Role) -> &'static str {
    role.as_str()
}

/// Canonical JSON form of a request
///
/// Drops metadata, the end-user id and volatile parameters. Parameter maps
/// are ordered, so two requests differing only in parameter order produce
/// the same string.
pub fn normalize(request: &LlmRequest) -> String {
    let normalized = NormalizedRequest {
        kind: request.kind,
        messages: request
            .messages
            .iter()
            .map(|m| NormalizedMessage {
                role: role_str(m.role),
                content: normalize_text(&m.content),
            })
            .collect(),
        prompt: request.prompt.as_deref().map(normalize_text),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        parameters: request
            .parameters
            .iter()
            .filter(|(name, _)| !VOLATILE_PARAMETERS.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), value))
            .collect(),
    };

    // Only plain data is serialized; this cannot fail.
    serde_json::to_string(&normalized).unwrap_or_default()
}

/// SHA-256 hex digest of the normalised request
pub fn cache_key(request: &LlmRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(request).as_bytes());
    hex::encode(hasher.finalize())
}
