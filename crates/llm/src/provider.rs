//! Completion backends.
//!
//! The pipeline talks to one `CompletionBackend`; the HTTP implementation
//! speaks the OpenAI-compatible chat API, which every configured provider
//! (or proxy) exposes. Provider quirks stay behind this seam.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::types::{ResponseFormat, TokenUsage};
use crate::LlmError;

/// One provider call, already resolved to a concrete model.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_output_tokens: usize,
    pub response_format: ResponseFormat,
    pub timeout: Duration,
}

/// Raw provider response before accounting.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, LlmError>;
}

/// OpenAI-compatible chat-completions backend.
pub struct OpenAiCompatBackend {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, LlmError> {
        let wire = ChatRequest {
            model: request.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_output_tokens),
            response_format: match request.response_format {
                ResponseFormat::Text => None,
                ResponseFormat::Json => Some(WireResponseFormat {
                    kind: "json_object".to_string(),
                }),
            },
        };

        let mut builder = self
            .client
            .post(self.chat_url())
            .timeout(request.timeout)
            .json(&wire);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    model: request.model.clone(),
                }
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => LlmError::Quota {
                    model: request.model.clone(),
                    message,
                },
                code if code >= 500 => LlmError::Upstream {
                    model: request.model.clone(),
                    status: code,
                    message,
                },
                code => LlmError::MalformedResponse {
                    model: request.model.clone(),
                    message: format!("unexpected status {code}: {message}"),
                },
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            LlmError::MalformedResponse {
                model: request.model.clone(),
                message: e.to_string(),
            }
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedResponse {
                model: request.model.clone(),
                message: "no choices in response".to_string(),
            })?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(BackendResponse {
            text: choice.message.content,
            usage,
        })
    }
}

/// Approximate USD cost for a finished call. Unknown models cost zero; the
/// ledger still carries their token counts.
pub fn model_cost_usd(model: &str, usage: TokenUsage) -> f64 {
    // (input, output) USD per million tokens.
    let (input_per_m, output_per_m) = if model.starts_with("gpt-4o-mini") {
        (0.15, 0.60)
    } else if model.starts_with("gpt-4o") {
        (2.50, 10.00)
    } else if model.starts_with("gpt-4") {
        (30.00, 60.00)
    } else if model.starts_with("claude-3-5") || model.starts_with("claude-sonnet") {
        (3.00, 15.00)
    } else if model.starts_with("claude-3-haiku") || model.starts_with("claude-haiku") {
        (0.25, 1.25)
    } else {
        (0.0, 0.0)
    };
    usage.input_tokens as f64 * input_per_m / 1e6 + usage.output_tokens as f64 * output_per_m / 1e6
}

// OpenAI-compatible wire types.

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Debug, Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
