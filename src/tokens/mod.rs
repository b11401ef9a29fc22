//! Token counting module
//!
//! Provides token estimation using tiktoken-rs.

pub mod counter;

pub use counter::{count_request_tokens, count_tokens, expected_output_tokens};
