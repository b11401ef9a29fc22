//! Request and response payloads
//!
//! Defines the provider-neutral request shape the engine routes and caches,
//! and the response shape every backend produces.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Logical request type
///
/// The cache restricts semantic matches to entries of the same kind and
/// the load balancer maps it to a required model capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Multi-turn chat completion
    Chat,
    /// Single prompt text completion
    Completion,
    /// Embedding of the prompt text
    Embedding,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Chat => write!(f, "chat"),
            RequestKind::Completion => write!(f, "completion"),
            RequestKind::Embedding => write!(f, "embedding"),
        }
    }
}

/// Role of a message participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions or context
    System,
    /// User message from the human
    User,
    /// Assistant message from the model
    Assistant,
    /// Tool/function result message
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A chat message with role and text content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Inbound completion/embedding request
///
/// `metadata` and `user` are volatile: they are carried through for
/// observability but never take part in cache keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub kind: RequestKind,
    /// Chat history (chat requests)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Prompt text (completion and embedding requests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Extra provider parameters, kept sorted for canonical hashing
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl LlmRequest {
    fn empty(kind: RequestKind) -> Self {
        Self {
            kind,
            messages: Vec::new(),
            prompt: None,
            max_tokens: None,
            temperature: None,
            parameters: BTreeMap::new(),
            metadata: HashMap::new(),
            user: None,
        }
    }

    /// Create a chat request
    pub fn chat(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::empty(RequestKind::Chat)
        }
    }

    /// Create a text completion request
    pub fn completion(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::empty(RequestKind::Completion)
        }
    }

    /// Create an embedding request
    pub fn embedding(input: impl Into<String>) -> Self {
        Self {
            prompt: Some(input.into()),
            ..Self::empty(RequestKind::Embedding)
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// All user-visible text of the request, in order
    ///
    /// Used for embeddings (semantic cache) and token estimation.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = self.messages.iter().map(|m| m.content.as_str()).collect();
        if let Some(prompt) = &self.prompt {
            parts.push(prompt);
        }
        parts.join("\n")
    }

    /// Whether the request carries any input at all
    pub fn is_empty(&self) -> bool {
        self.messages.iter().all(|m| m.content.trim().is_empty())
            && self.prompt.as_deref().map_or(true, |p| p.trim().is_empty())
    }
}

/// Response payload produced by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text (empty for embedding requests)
    #[serde(default)]
    pub content: String,
    /// Embedding vector (embedding requests only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Model identifier reported by the provider
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl LlmResponse {
    pub fn text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embedding: None,
            model: model.into(),
            finish_reason: Some("stop".to_string()),
        }
    }
}
