//! External retrieval adapters and the paper finder.
//!
//! Narrow clients for the paper index (snippet search, keyword search,
//! batch metadata), the remote reranker and the optional moderation
//! service, plus the composition that turns a decomposed query into ranked
//! paper aggregates with dense reference numbers.

pub mod metadata_cache;
pub mod moderation;
pub mod paper_finder;
pub mod paper_index;
pub mod reranker;

pub use metadata_cache::MetadataCache;
pub use moderation::{AllowAll, HttpModerator, ModerationVerdict, Moderator};
pub use paper_finder::{FinderOutput, PaperFinder};
pub use paper_index::{HttpPaperIndex, PaperIndex};
pub use reranker::{build_reranker, HttpReranker, LexicalReranker, Reranker};

use thiserror::Error;

/// Adapter failure classification.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("throttled by upstream: {0}")]
    Throttled(String),

    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// Snippet search failed permanently; the retrieval stage cannot run.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,
}

impl RetrievalError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RetrievalError::Throttled(_) | RetrievalError::Network(_) | RetrievalError::Timeout => {
                true
            }
            RetrievalError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RetrievalError::Timeout
        } else {
            RetrievalError::Network(err.to_string())
        }
    }
}

impl From<RetrievalError> for scholarqa_core::Error {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::Cancelled => scholarqa_core::Error::Cancelled,
            other => scholarqa_core::Error::Retrieval(other.to_string()),
        }
    }
}
