//! Model-driven pipeline stages.
//!
//! Each stage wraps the model client with its prompts, schemas, validation
//! and degraded paths: query decomposition, per-paper evidence extraction,
//! outline planning, ordered section synthesis and comparison-table
//! building.

pub mod cost;
pub mod decomposer;
pub mod extractor;
pub mod planner;
pub mod prompts;
pub mod schemas;
pub mod synthesizer;
pub mod tables;

pub use cost::CostLedger;
pub use decomposer::{DecomposeOutcome, QueryDecomposer};
pub use extractor::{EvidenceExtractor, ExtractOutcome};
pub use planner::{OutlinePlanner, PlanOutcome};
pub use synthesizer::{SectionSynthesizer, SynthOutcome};
pub use tables::TableBuilder;

use scholarqa_llm::LlmError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Retrieval produced zero papers; the task cannot continue.
    #[error("no relevant papers found")]
    NoPapers,

    /// Extraction produced zero quotes across all papers.
    #[error("no supporting evidence could be extracted")]
    NoQuotes,

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Llm(LlmError::Cancelled)
        )
    }
}

impl From<PipelineError> for scholarqa_core::Error {
    fn from(err: PipelineError) -> Self {
        if err.is_cancellation() {
            scholarqa_core::Error::Cancelled
        } else {
            scholarqa_core::Error::Pipeline(err.to_string())
        }
    }
}
