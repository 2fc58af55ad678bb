//! Error types shared across the workspace.

use std::time::Duration;
use thiserror::Error;

/// Top-level error. Subsystem crates define their own error enums and
/// convert into this at the crate boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model client error: {0}")]
    Llm(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("moderation blocked the query: {0}")]
    ModerationBlocked(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether this error terminates a task as `cancelled` rather than `failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
