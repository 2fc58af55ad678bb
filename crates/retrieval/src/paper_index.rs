//! Paper index adapter.
//!
//! Speaks a Semantic-Scholar-style HTTP API: passage-level snippet search,
//! paper-level keyword search and batch metadata lookup. All operations are
//! idempotent; throttling is retried with backoff honoring `Retry-After`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scholarqa_config::PaperIndexConfig;
use scholarqa_core::{
    Author, CancelToken, CandidatePassage, CorpusId, PaperRecord, RetrievalFilters, SnippetKind,
};
use serde::Deserialize;

use crate::RetrievalError;

const MAX_RETRIES: u32 = 3;
const PAPER_FIELDS: &str =
    "corpusId,title,abstract,year,venue,citationCount,influentialCitationCount,isOpenAccess,authors";

#[async_trait]
pub trait PaperIndex: Send + Sync {
    /// Passage-level search over the corpus.
    async fn snippet_search(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<CandidatePassage>, RetrievalError>;

    /// Paper-level keyword search; records include abstracts when available.
    async fn keyword_search(
        &self,
        keyword_query: &str,
        filters: &RetrievalFilters,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<PaperRecord>, RetrievalError>;

    /// Batch metadata lookup. Ids missing upstream are absent from the map.
    async fn fetch_metadata(
        &self,
        corpus_ids: &[CorpusId],
        cancel: &CancelToken,
    ) -> Result<HashMap<CorpusId, PaperRecord>, RetrievalError>;
}

pub struct HttpPaperIndex {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPaperIndex {
    pub fn new(config: &PaperIndexConfig) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RetrievalError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn filter_params(filters: &RetrievalFilters) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(years) = &filters.years {
            // Half-open [start, end) rendered as the index's inclusive span.
            let span = match (years.start, years.end) {
                (Some(s), Some(e)) => format!("{s}-{}", e - 1),
                (Some(s), None) => format!("{s}-"),
                (None, Some(e)) => format!("-{}", e - 1),
                (None, None) => String::new(),
            };
            if !span.is_empty() {
                params.push(("year".to_string(), span));
            }
        }
        if !filters.venues.is_empty() {
            params.push((
                "venue".to_string(),
                filters.venues.iter().cloned().collect::<Vec<_>>().join(","),
            ));
        }
        if !filters.fields_of_study.is_empty() {
            params.push((
                "fieldsOfStudy".to_string(),
                filters
                    .fields_of_study
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            ));
        }
        params
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        cancel: &CancelToken,
    ) -> Result<reqwest::Response, RetrievalError> {
        let mut backoff = Duration::from_millis(500);

        for attempt in 0..=MAX_RETRIES {
            if cancel.is_cancelled() {
                return Err(RetrievalError::Cancelled);
            }
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
                }
                backoff *= 2;
            }

            let mut request = build();
            if let Some(ref key) = self.api_key {
                request = request.header("x-api-key", key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    tracing::warn!(attempt, "paper index request timed out");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "paper index network error");
                    if attempt == MAX_RETRIES {
                        return Err(RetrievalError::Network(e.to_string()));
                    }
                    continue;
                }
            };

            match response.status() {
                StatusCode::OK => return Ok(response),
                StatusCode::NOT_FOUND => {
                    return Err(RetrievalError::NotFound("paper index".to_string()))
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    if let Some(retry_after) = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                    {
                        backoff = Duration::from_secs(retry_after);
                    }
                    tracing::warn!(attempt, "paper index throttled");
                    if attempt == MAX_RETRIES {
                        return Err(RetrievalError::Throttled(
                            "paper index rate limit".to_string(),
                        ));
                    }
                }
                status if status.is_server_error() => {
                    let message = response.text().await.unwrap_or_default();
                    tracing::warn!(attempt, %status, "paper index server error");
                    if attempt == MAX_RETRIES {
                        return Err(RetrievalError::Upstream {
                            status: status.as_u16(),
                            message,
                        });
                    }
                }
                status => {
                    let message = response.text().await.unwrap_or_default();
                    return Err(RetrievalError::Upstream {
                        status: status.as_u16(),
                        message,
                    });
                }
            }
        }

        Err(RetrievalError::Timeout)
    }
}

#[async_trait]
impl PaperIndex for HttpPaperIndex {
    async fn snippet_search(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<CandidatePassage>, RetrievalError> {
        let url = format!("{}/snippet/search", self.endpoint);
        let mut params = vec![
            ("query".to_string(), query.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        params.extend(Self::filter_params(filters));

        let response = self
            .send_with_retry(|| self.client.get(&url).query(&params), cancel)
            .await?;
        let body: SnippetSearchResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Network(format!("snippet response: {e}")))?;

        Ok(body
            .data
            .into_iter()
            .filter_map(|item| {
                let corpus_id = wire_corpus_id(item.paper?.corpus_id?)?;
                let snippet = item.snippet?;
                Some(CandidatePassage {
                    corpus_id,
                    text: snippet.text?,
                    section: snippet.section,
                    kind: snippet
                        .snippet_kind
                        .as_deref()
                        .map(parse_snippet_kind)
                        .unwrap_or(SnippetKind::Other),
                    score: item.score.unwrap_or(0.0),
                    offsets: snippet
                        .snippet_offset
                        .map(|o| (o.start.unwrap_or(0), o.end.unwrap_or(0))),
                })
            })
            .collect())
    }

    async fn keyword_search(
        &self,
        keyword_query: &str,
        filters: &RetrievalFilters,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<PaperRecord>, RetrievalError> {
        let url = format!("{}/paper/search", self.endpoint);
        let mut params = vec![
            ("query".to_string(), keyword_query.to_string()),
            ("limit".to_string(), limit.to_string()),
            ("fields".to_string(), PAPER_FIELDS.to_string()),
        ];
        params.extend(Self::filter_params(filters));

        let response = self
            .send_with_retry(|| self.client.get(&url).query(&params), cancel)
            .await?;
        let body: PaperSearchResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Network(format!("paper search response: {e}")))?;

        Ok(body.data.into_iter().filter_map(|p| p.into_record()).collect())
    }

    async fn fetch_metadata(
        &self,
        corpus_ids: &[CorpusId],
        cancel: &CancelToken,
    ) -> Result<HashMap<CorpusId, PaperRecord>, RetrievalError> {
        if corpus_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let url = format!("{}/paper/batch", self.endpoint);
        let ids: Vec<String> = corpus_ids
            .iter()
            .map(|id| format!("CorpusId:{id}"))
            .collect();
        let body = serde_json::json!({ "ids": ids });

        let response = self
            .send_with_retry(
                || {
                    self.client
                        .post(&url)
                        .query(&[("fields", PAPER_FIELDS)])
                        .json(&body)
                },
                cancel,
            )
            .await?;
        let papers: Vec<Option<WirePaper>> = response
            .json()
            .await
            .map_err(|e| RetrievalError::Network(format!("metadata response: {e}")))?;

        Ok(papers
            .into_iter()
            .flatten()
            .filter_map(|p| p.into_record())
            .map(|r| (r.corpus_id.clone(), r))
            .collect())
    }
}

fn parse_snippet_kind(kind: &str) -> SnippetKind {
    match kind {
        "abstract" => SnippetKind::Abstract,
        "body" => SnippetKind::Body,
        "title" => SnippetKind::Title,
        _ => SnippetKind::Other,
    }
}

// Wire types.

#[derive(Debug, Deserialize)]
struct SnippetSearchResponse {
    #[serde(default)]
    data: Vec<SnippetItem>,
}

#[derive(Debug, Deserialize)]
struct SnippetItem {
    #[serde(default)]
    snippet: Option<WireSnippet>,
    #[serde(default)]
    paper: Option<WireSnippetPaper>,
    #[serde(default)]
    score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct WireSnippet {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    section: Option<String>,
    #[serde(default, rename = "snippetKind")]
    snippet_kind: Option<String>,
    #[serde(default, rename = "snippetOffset")]
    snippet_offset: Option<WireOffset>,
}

#[derive(Debug, Deserialize)]
struct WireOffset {
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    end: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireSnippetPaper {
    #[serde(default, rename = "corpusId")]
    corpus_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PaperSearchResponse {
    #[serde(default)]
    data: Vec<WirePaper>,
}

#[derive(Debug, Deserialize)]
struct WirePaper {
    #[serde(default, rename = "corpusId")]
    corpus_id: Option<serde_json::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    venue: Option<String>,
    #[serde(default, rename = "citationCount")]
    citation_count: Option<u64>,
    #[serde(default, rename = "influentialCitationCount")]
    influential_citation_count: Option<u64>,
    #[serde(default, rename = "isOpenAccess")]
    open_access: Option<bool>,
    #[serde(default)]
    authors: Vec<WireAuthor>,
}

#[derive(Debug, Deserialize)]
struct WireAuthor {
    #[serde(default, rename = "authorId")]
    author_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl WirePaper {
    fn into_record(self) -> Option<PaperRecord> {
        let corpus_id = wire_corpus_id(self.corpus_id?)?;
        Some(PaperRecord {
            corpus_id,
            title: self.title.unwrap_or_else(|| "Untitled".to_string()),
            authors: self
                .authors
                .into_iter()
                .filter_map(|a| {
                    a.name.map(|name| Author {
                        name,
                        author_id: a.author_id,
                    })
                })
                .collect(),
            year: self.year,
            venue: self.venue.filter(|v| !v.is_empty()),
            citation_count: self.citation_count,
            influential_citation_count: self.influential_citation_count,
            open_access: self.open_access,
            abstract_text: self.abstract_text,
        })
    }
}

/// Corpus ids arrive as either JSON numbers or strings.
fn wire_corpus_id(value: serde_json::Value) -> Option<CorpusId> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
