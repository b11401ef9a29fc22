//! Scripted backend and embedder for testing
//!
//! Deterministic stand-ins for real providers: fixed or queued replies,
//! injected failures, artificial latency and call counting. Clones share
//! state, so a test can keep a handle after attaching the backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Embedder, Invocation};
use crate::error::ProviderError;
use crate::registry::ModelConfig;
use crate::tokens;
use crate::types::{LlmRequest, LlmResponse};

/// What the scripted backend answers
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Answer with the request text
    Echo,
    Embedding(Vec<f32>),
    Fail(ProviderError),
}

struct Inner {
    default: Reply,
    queued: Mutex<VecDeque<Reply>>,
    latency: Duration,
    calls: AtomicU32,
}

#[derive(Clone)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl ScriptedBackend {
    pub fn new(default: Reply) -> Self {
        Self {
            inner: Arc::new(Inner {
                default,
                queued: Mutex::new(VecDeque::new()),
                latency: Duration::ZERO,
                calls: AtomicU32::new(0),
            }),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(Reply::Text(content.into()))
    }

    pub fn echo() -> Self {
        Self::new(Reply::Echo)
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::new(Reply::Fail(error))
    }

    /// Delay every call; must be set before the backend is shared
    pub fn with_latency(self, latency: Duration) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => Inner {
                default: shared.default.clone(),
                queued: Mutex::new(shared.queued.lock().clone()),
                latency,
                calls: AtomicU32::new(shared.calls.load(Ordering::SeqCst)),
            },
        };
        Self {
            inner: Arc::new(Inner { latency, ..inner }),
        }
    }

    /// Answer the next call with `reply` before falling back to the default
    pub fn then(self, reply: Reply) -> Self {
        self.inner.queued.lock().push_back(reply);
        self
    }

    /// Number of invocations so far
    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub async fn invoke(
        &self,
        config: &ModelConfig,
        request: &LlmRequest,
    ) -> Result<Invocation, ProviderError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if !self.inner.latency.is_zero() {
            tokio::time::sleep(self.inner.latency).await;
        }

        let reply = self
            .inner
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.default.clone());
        let tokens_in = tokens::count_request_tokens(request) as u32;

        let response = match reply {
            Reply::Text(content) => LlmResponse::text(&config.name, content),
            Reply::Echo => LlmResponse::text(&config.name, request.text()),
            Reply::Embedding(vector) => LlmResponse {
                content: String::new(),
                embedding: Some(vector),
                model: config.name.clone(),
                finish_reason: None,
            },
            Reply::Fail(error) => return Err(error),
        };
        let tokens_out = tokens::count_tokens(&response.content) as u32;

        Ok(Invocation {
            response,
            tokens_in,
            tokens_out,
        })
    }
}

/// Embedder returning fixed vectors per exact text
#[derive(Clone, Default)]
pub struct StaticEmbedder {
    vectors: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    calls: Arc<AtomicU32>,
}

impl StaticEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.lock().insert(text.into(), vector);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for StaticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vectors
            .lock()
            .get(text)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown(format!("no vector for {:?}", text)))
    }
}
