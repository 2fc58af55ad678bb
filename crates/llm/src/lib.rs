//! Rate-limited language model client.
//!
//! One call site for every model interaction in the pipeline:
//! - three continuously-refilling token buckets per provider
//!   (requests / input tokens / output tokens per minute)
//! - primary-then-fallback model chains with exponential backoff
//! - structured output parsed and validated against a JSON schema
//! - content-addressed completion cache (memory LRU + optional disk mirror)

pub mod cache;
pub mod client;
pub mod provider;
pub mod rate_limit;
pub mod types;

pub use cache::{CachedCompletion, CompletionCache};
pub use client::ModelClient;
pub use provider::{BackendRequest, BackendResponse, CompletionBackend, OpenAiCompatBackend};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use types::{
    estimate_tokens, Completion, CompletionOptions, ModelChain, ResponseFormat, TokenUsage,
};

use thiserror::Error;

/// Model client errors.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Rate-limit buckets could not be acquired within the wait budget.
    #[error("rate limit wait budget exhausted for model {model}")]
    RateLimitedExhausted { model: String },

    #[error("upstream error {status} from model {model}: {message}")]
    Upstream {
        model: String,
        status: u16,
        message: String,
    },

    /// Provider-reported throttling or quota exhaustion.
    #[error("provider quota error for model {model}: {message}")]
    Quota { model: String, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request to model {model} timed out")]
    Timeout { model: String },

    #[error("malformed completion from model {model}: {message}")]
    MalformedResponse { model: String, message: String },

    /// Structured completion did not conform to the requested schema.
    #[error("schema violation from model {model}: {message}")]
    SchemaViolation { model: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transport-level failures retried on the same model before falling back.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Upstream { status, .. } if *status >= 500
        ) || matches!(
            self,
            LlmError::Network(_) | LlmError::Timeout { .. } | LlmError::Quota { .. }
        )
    }
}

impl From<LlmError> for scholarqa_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => scholarqa_core::Error::Cancelled,
            other => scholarqa_core::Error::Llm(other.to_string()),
        }
    }
}
