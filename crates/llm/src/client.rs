//! Rate-limited, cached, fallback-aware model client.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use scholarqa_core::CancelToken;
use serde_json::Value;

use crate::cache::{cache_key, CachedCompletion, CompletionCache};
use crate::provider::{model_cost_usd, BackendRequest, CompletionBackend};
use crate::rate_limit::RateLimiter;
use crate::types::{estimate_tokens, Completion, CompletionOptions, ModelChain, ResponseFormat};
use crate::LlmError;

/// Same-model retries for schema violations before the stage degrades.
const SCHEMA_RETRIES: u32 = 2;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Uniform entry point for every model call in the pipeline.
///
/// Construction order per call: cache lookup, bucket acquisition, dispatch
/// with same-model retries, then fallback to the next model in the chain.
/// Cache hits bypass the buckets entirely.
pub struct ModelClient {
    backend: Arc<dyn CompletionBackend>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<CompletionCache>>,
}

impl ModelClient {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        limiter: Arc<RateLimiter>,
        cache: Option<Arc<CompletionCache>>,
    ) -> Self {
        Self {
            backend,
            limiter,
            cache,
        }
    }

    /// Free-text completion against a primary-then-fallback chain.
    pub async fn complete(
        &self,
        chain: &ModelChain,
        system: &str,
        user: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        let mut last_error = None;

        for model in chain.models() {
            cancel.check().map_err(|_| LlmError::Cancelled)?;
            let is_fallback = model != chain.primary;

            let key = cache_key(model, system, user, &options.normalized());
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.get(&key) {
                    tracing::debug!(model, "completion served from cache");
                    return Ok(Completion {
                        text: hit.text,
                        model: hit.model,
                        usage: hit.usage,
                        cost_usd: hit.cost_usd,
                        cached: true,
                        fallback: is_fallback,
                        waited_ms: 0,
                    });
                }
            }

            let est_input = estimate_tokens(system) + estimate_tokens(user);
            let est_output = options.max_output_tokens as u64;
            let waited = match self
                .limiter
                .acquire(model, est_input, est_output, cancel)
                .await
            {
                Ok(waited) => waited,
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(err @ LlmError::RateLimitedExhausted { .. }) => {
                    // Immediate fallback to the next model in the chain.
                    tracing::warn!(model, "rate limit wait budget exhausted");
                    last_error = Some(err);
                    continue;
                }
                Err(other) => return Err(other),
            };

            match self
                .dispatch_with_retries(model, system, user, options, cancel)
                .await
            {
                Ok(response) => {
                    let mut usage = response.usage;
                    if usage.input_tokens == 0 {
                        usage.input_tokens = est_input;
                    }
                    if usage.output_tokens == 0 {
                        usage.output_tokens = estimate_tokens(&response.text);
                    }
                    self.limiter.reconcile_output(est_output, usage.output_tokens);

                    let cost_usd = model_cost_usd(model, usage);
                    let completion = Completion {
                        text: response.text,
                        model: model.to_string(),
                        usage,
                        cost_usd,
                        cached: false,
                        fallback: is_fallback,
                        waited_ms: waited.as_millis() as u64,
                    };
                    if let Some(cache) = &self.cache {
                        cache.put(
                            &key,
                            CachedCompletion {
                                text: completion.text.clone(),
                                model: completion.model.clone(),
                                usage,
                                cost_usd,
                            },
                        );
                    }
                    return Ok(completion);
                }
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(err) if err.is_retryable() => {
                    // Same-model retries were already spent; advance the chain.
                    tracing::warn!(model, error = %err, "model failed, advancing fallback chain");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Configuration("empty model chain".into())))
    }

    /// Structured completion: JSON mode plus client-side schema validation.
    /// Violations retry up to a small bound before escalating to the stage.
    pub async fn complete_structured(
        &self,
        chain: &ModelChain,
        system: &str,
        user: &str,
        options: &CompletionOptions,
        schema: &Value,
        cancel: &CancelToken,
    ) -> Result<(Value, Completion), LlmError> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| LlmError::Configuration(format!("invalid schema: {e}")))?;

        let mut last_error = None;
        for attempt in 0..=SCHEMA_RETRIES {
            cancel.check().map_err(|_| LlmError::Cancelled)?;

            let mut attempt_options = options.clone();
            attempt_options.response_format = ResponseFormat::Json;
            if attempt > 0 {
                // A violating completion may be cached; vary the key so the
                // retry actually reaches the provider.
                attempt_options.cache_salt = Some(match &options.cache_salt {
                    Some(salt) => format!("{salt}#retry{attempt}"),
                    None => format!("#retry{attempt}"),
                });
            }

            let completion = self
                .complete(chain, system, user, &attempt_options, cancel)
                .await?;

            match parse_and_validate(&completion.text, &compiled, &completion.model) {
                Ok(value) => return Ok((value, completion)),
                Err(err) => {
                    tracing::warn!(
                        model = %completion.model,
                        attempt,
                        error = %err,
                        "structured completion failed validation"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Configuration("no schema attempts ran".into())))
    }

    async fn dispatch_with_retries(
        &self,
        model: &str,
        system: &str,
        user: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> Result<crate::provider::BackendResponse, LlmError> {
        let request = BackendRequest {
            model: model.to_string(),
            system: system.to_string(),
            user: user.to_string(),
            temperature: options.temperature,
            max_output_tokens: options.max_output_tokens,
            response_format: options.response_format,
            timeout: options.timeout,
        };

        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;

        for attempt in 0..=options.max_retries {
            if attempt > 0 {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                tracing::warn!(
                    model,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying model call"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff + jitter) => {}
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                }
                backoff *= 2;
            }

            match self.backend.complete(&request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(LlmError::Timeout {
            model: model.to_string(),
        }))
    }
}

/// Pull a JSON document out of a completion, tolerating code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    unfenced.trim()
}

fn parse_and_validate(
    text: &str,
    compiled: &jsonschema::JSONSchema,
    model: &str,
) -> Result<Value, LlmError> {
    let value: Value =
        serde_json::from_str(extract_json(text)).map_err(|e| LlmError::SchemaViolation {
            model: model.to_string(),
            message: format!("not valid JSON: {e}"),
        })?;

    if let Err(errors) = compiled.validate(&value) {
        let message = errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(LlmError::SchemaViolation {
            model: model.to_string(),
            message,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::BackendResponse;
    use crate::rate_limit::RateLimitConfig;
    use crate::types::TokenUsage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct MockBackend {
        responses: Mutex<VecDeque<Result<BackendResponse, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(responses: Vec<Result<BackendResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn ok(text: &str) -> Result<BackendResponse, LlmError> {
            Ok(BackendResponse {
                text: text.to_string(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }

        fn upstream(model: &str) -> Result<BackendResponse, LlmError> {
            Err(LlmError::Upstream {
                model: model.to_string(),
                status: 503,
                message: "unavailable".to_string(),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl CompletionBackend for MockBackend {
        async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, LlmError> {
            self.calls.lock().push(request.model.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| MockBackend::ok("default"))
        }
    }

    fn client(backend: Arc<MockBackend>, cache: Option<Arc<CompletionCache>>) -> ModelClient {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_minute: 10_000,
            input_tokens_per_minute: 10_000_000,
            output_tokens_per_minute: 10_000_000,
            max_wait: Duration::from_millis(100),
        }));
        ModelClient::new(backend, limiter, cache)
    }

    fn fast_options() -> CompletionOptions {
        CompletionOptions {
            max_retries: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fallback_after_retries() {
        let backend = MockBackend::new(vec![
            MockBackend::upstream("a"),
            MockBackend::upstream("a"),
            MockBackend::ok("from fallback"),
        ]);
        let client = client(backend.clone(), None);
        let chain = ModelChain::with_fallbacks("a", vec!["b".into()]);

        let completion = client
            .complete(&chain, "sys", "user", &fast_options(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(completion.text, "from fallback");
        assert_eq!(completion.model, "b");
        assert!(completion.fallback);
        let calls = backend.calls.lock().clone();
        assert_eq!(calls, vec!["a", "a", "b"]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let backend = MockBackend::new(vec![MockBackend::ok("fresh")]);
        let cache = Arc::new(CompletionCache::new(64, None));
        let client = client(backend.clone(), Some(cache));
        let chain = ModelChain::single("a");
        let options = fast_options();
        let cancel = CancelToken::new();

        let first = client
            .complete(&chain, "sys", "user", &options, &cancel)
            .await
            .unwrap();
        assert!(!first.cached);

        let second = client
            .complete(&chain, "sys", "user", &options, &cancel)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.text, "fresh");
        // Cached cost accounting is preserved.
        assert_eq!(second.usage, first.usage);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates() {
        let backend = MockBackend::new(vec![Err(LlmError::MalformedResponse {
            model: "a".into(),
            message: "garbage".into(),
        })]);
        let client = client(backend.clone(), None);
        let chain = ModelChain::with_fallbacks("a", vec!["b".into()]);

        let err = client
            .complete(&chain, "sys", "user", &fast_options(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse { .. }));
        // No fallback was attempted.
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_structured_retries_then_succeeds() {
        let backend = MockBackend::new(vec![
            MockBackend::ok("not json at all"),
            MockBackend::ok(r#"{"answer": "42"}"#),
        ]);
        let client = client(backend.clone(), None);
        let chain = ModelChain::single("a");
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"]
        });

        let (value, _) = client
            .complete_structured(
                &chain,
                "sys",
                "user",
                &fast_options(),
                &schema,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(value["answer"], "42");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_structured_escalates_after_bound() {
        let backend = MockBackend::new(vec![
            MockBackend::ok("junk"),
            MockBackend::ok("junk"),
            MockBackend::ok("junk"),
            MockBackend::ok("junk"),
        ]);
        let client = client(backend.clone(), None);
        let schema = serde_json::json!({"type": "object"});

        let err = client
            .complete_structured(
                &ModelChain::single("a"),
                "sys",
                "user",
                &fast_options(),
                &schema,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::SchemaViolation { .. }));
        assert_eq!(backend.call_count(), (SCHEMA_RETRIES + 1) as usize);
    }

    #[tokio::test]
    async fn test_cancel_short_circuits() {
        let backend = MockBackend::new(vec![]);
        let client = client(backend.clone(), None);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = client
            .complete(
                &ModelChain::single("a"),
                "sys",
                "user",
                &fast_options(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_extract_json_handles_fences() {
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
