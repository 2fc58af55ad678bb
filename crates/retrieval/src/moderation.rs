//! Optional content-moderation adapter.
//!
//! When moderation is disabled the supervisor uses `AllowAll`, so every
//! caller can treat the gate as always present.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scholarqa_core::CancelToken;
use serde::{Deserialize, Serialize};

use crate::RetrievalError;

/// Classification of a submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationVerdict {
    Allow,
    Block { reason: String },
}

#[async_trait]
pub trait Moderator: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<ModerationVerdict, RetrievalError>;
}

/// Default gate when moderation is disabled.
pub struct AllowAll;

#[async_trait]
impl Moderator for AllowAll {
    async fn classify(
        &self,
        _text: &str,
        _cancel: &CancelToken,
    ) -> Result<ModerationVerdict, RetrievalError> {
        Ok(ModerationVerdict::Allow)
    }
}

/// Remote moderation endpoint: `{text} -> {allow, reason?}`.
pub struct HttpModerator {
    client: Client,
    endpoint: String,
}

impl HttpModerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Moderator for HttpModerator {
    async fn classify(
        &self,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<ModerationVerdict, RetrievalError> {
        cancel.check().map_err(|_| RetrievalError::Cancelled)?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&ModerationRequest {
                text: text.to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let body: ModerationResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Network(format!("moderation response: {e}")))?;

        Ok(if body.allow {
            ModerationVerdict::Allow
        } else {
            ModerationVerdict::Block {
                reason: body
                    .reason
                    .unwrap_or_else(|| "policy violation".to_string()),
            }
        })
    }
}

#[derive(Debug, Serialize)]
struct ModerationRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    allow: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_allows() {
        let verdict = AllowAll
            .classify("anything", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, ModerationVerdict::Allow);
    }
}
