//! Request and response shapes for the model client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Primary model plus ordered fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChain {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl ModelChain {
    pub fn single(model: impl Into<String>) -> Self {
        Self {
            primary: model.into(),
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallbacks(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks,
        }
    }

    /// Primary first, then fallbacks in order.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// Requested completion shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    /// Provider-side JSON mode; schema enforcement happens client-side.
    Json,
}

/// Per-call options. The normalized form participates in the cache key.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_output_tokens: usize,
    pub response_format: ResponseFormat,
    pub timeout: Duration,
    /// Same-model retries for transient upstream failures.
    pub max_retries: u32,
    /// Extra discriminator mixed into the cache key.
    pub cache_salt: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: 1024,
            response_format: ResponseFormat::Text,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            cache_salt: None,
        }
    }
}

impl CompletionOptions {
    /// Stable textual form for cache-key hashing.
    pub fn normalized(&self) -> String {
        format!(
            "t={:.3};max={};fmt={};salt={}",
            self.temperature,
            self.max_output_tokens,
            match self.response_format {
                ResponseFormat::Text => "text",
                ResponseFormat::Json => "json",
            },
            self.cache_salt.as_deref().unwrap_or("")
        )
    }
}

/// Token counts reported (or estimated) for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A finished completion with its accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Model that actually produced the text.
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Served from the completion cache; no bucket tokens were consumed.
    pub cached: bool,
    /// Whether a fallback model (not the chain primary) produced the text.
    pub fallback: bool,
    /// Time spent waiting on rate-limit buckets.
    pub waited_ms: u64,
}

/// Grapheme-based token estimate, roughly four characters per token.
/// Used for bucket acquisition before the provider reports real counts.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.graphemes(true).count().max(1) as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_iterates_primary_first() {
        let chain = ModelChain::with_fallbacks("a", vec!["b".into(), "c".into()]);
        let models: Vec<&str> = chain.models().collect();
        assert_eq!(models, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_estimate_tokens_scales_with_length() {
        assert_eq!(estimate_tokens(""), 1);
        let est = estimate_tokens("The quick brown fox jumps over the lazy dog.");
        assert!((8..=16).contains(&est), "estimate {est} out of range");
    }

    #[test]
    fn test_normalized_options_distinguish_salt() {
        let a = CompletionOptions::default();
        let mut b = CompletionOptions::default();
        b.cache_salt = Some("retry-1".into());
        assert_ne!(a.normalized(), b.normalized());
    }
}
