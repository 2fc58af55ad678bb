//! Reranker backends.
//!
//! One interface: `score(query, passages)` returning floats aligned 1:1
//! with the input. The remote backends split work into bounded batches and
//! cap in-flight requests; the in-process variants score by lexical overlap
//! so deployments without a reranker service still rank deterministically.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use scholarqa_config::{RerankConfig, RerankService};
use scholarqa_core::CancelToken;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::RetrievalError;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Relevance scores in `[0, 1]`, aligned with `passages`.
    async fn score(
        &self,
        query: &str,
        passages: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, RetrievalError>;
}

/// How the remote service authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteAuth {
    /// `x-api-key` header (plain HTTP deployments).
    ApiKeyHeader,
    /// Bearer token (modal-style serverless deployments).
    Bearer,
}

/// Remote reranker speaking `{query, passages} -> {scores}`.
pub struct HttpReranker {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    auth: RemoteAuth,
    batch_size: usize,
    max_inflight: usize,
    inflight: Arc<Semaphore>,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self, RetrievalError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| RetrievalError::Configuration("rerank.endpoint missing".into()))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.client_timeout_ms))
            .build()
            .map_err(|e| RetrievalError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            auth: match config.service {
                RerankService::ModalLike => RemoteAuth::Bearer,
                _ => RemoteAuth::ApiKeyHeader,
            },
            batch_size: config.batch_size,
            max_inflight: config.max_inflight,
            inflight: Arc::new(Semaphore::new(config.max_inflight)),
        })
    }

    async fn score_batch(
        &self,
        query: &str,
        batch: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, RetrievalError> {
        let _permit = tokio::select! {
            permit = self.inflight.clone().acquire_owned() => {
                permit.map_err(|_| RetrievalError::Configuration("reranker semaphore closed".into()))?
            }
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
        };
        cancel.check().map_err(|_| RetrievalError::Cancelled)?;

        let request = RerankRequest {
            query: query.to_string(),
            passages: batch.to_vec(),
            batch_size: self.batch_size,
        };
        let mut builder = self.client.post(&self.endpoint).json(&request);
        builder = match (&self.api_key, self.auth) {
            (Some(key), RemoteAuth::Bearer) => builder.bearer_auth(key),
            (Some(key), RemoteAuth::ApiKeyHeader) => builder.header("x-api-key", key),
            (None, _) => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let body: RerankResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Network(format!("rerank response: {e}")))?;
        if body.scores.len() != batch.len() {
            return Err(RetrievalError::Upstream {
                status: status.as_u16(),
                message: format!(
                    "misaligned rerank response: {} scores for {} passages",
                    body.scores.len(),
                    batch.len()
                ),
            });
        }
        Ok(body.scores)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(
        &self,
        query: &str,
        passages: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, RetrievalError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<(usize, Vec<String>)> = passages
            .chunks(self.batch_size)
            .enumerate()
            .map(|(i, chunk)| (i, chunk.to_vec()))
            .collect();

        let mut scored: Vec<(usize, Vec<f32>)> = stream::iter(batches)
            .map(|(i, batch)| async move {
                self.score_batch(query, &batch, cancel).await.map(|s| (i, s))
            })
            .buffer_unordered(self.max_inflight)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        scored.sort_by_key(|(i, _)| *i);
        Ok(scored.into_iter().flat_map(|(_, s)| s).collect())
    }
}

/// In-process fallback: normalized term overlap between query and passage.
#[derive(Debug, Default)]
pub struct LexicalReranker;

impl LexicalReranker {
    fn terms(text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(|t| t.to_lowercase())
            .collect()
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    async fn score(
        &self,
        query: &str,
        passages: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, RetrievalError> {
        cancel.check().map_err(|_| RetrievalError::Cancelled)?;
        let query_terms = Self::terms(query);
        Ok(passages
            .iter()
            .map(|p| {
                let passage_terms = Self::terms(p);
                if query_terms.is_empty() || passage_terms.is_empty() {
                    return 0.0;
                }
                let overlap = query_terms.intersection(&passage_terms).count() as f32;
                overlap / (query_terms.len() as f32 * passage_terms.len() as f32).sqrt()
            })
            .map(|s| s.clamp(0.0, 1.0))
            .collect())
    }
}

/// Construct the configured reranker backend.
pub fn build_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>, RetrievalError> {
    match config.service {
        RerankService::RemoteHttp | RerankService::ModalLike => {
            Ok(Arc::new(HttpReranker::new(config)?))
        }
        RerankService::InProcessCrossencoder
        | RerankService::InProcessBiencoder
        | RerankService::InProcessFlag => {
            tracing::info!(service = ?config.service, "using in-process lexical reranker");
            Ok(Arc::new(LexicalReranker))
        }
    }
}

#[derive(Debug, Serialize)]
struct RerankRequest {
    query: String,
    passages: Vec<String>,
    batch_size: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}
