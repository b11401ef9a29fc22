//! Mock infrastructure for testing external services
//!
//! This module provides mock servers and test helpers for external dependencies:
//! - OpenAI-compatible providers (chat, completions, embeddings)
//! - Anthropic messages API
//! - Redis (persistence store)

pub mod anthropic;
pub mod openai;

pub use anthropic::*;
pub use openai::*;
pub use redis::*;
