//! Core types for the scholar QA orchestrator
//!
//! This crate provides the types shared by every other crate:
//! - Task lifecycle (task, step, status, result, wire document)
//! - Retrieval types (decomposed query, passages, paper records, aggregates)
//! - Evidence types (quote sets, quote handles)
//! - Outline, generated sections, citations and comparison tables
//! - Cooperative cancellation token
//! - Error types

pub mod cancel;
pub mod cite;
pub mod error;
pub mod outline;
pub mod paper;
pub mod query;
pub mod quote;
pub mod section;
pub mod table;
pub mod task;

pub use cancel::CancelToken;
pub use cite::{extract_markers, strip_unresolved_markers, CitationMarker};
pub use error::{Error, Result};
pub use outline::{Outline, SectionFormat, SectionPlan};
pub use paper::{
    Author, CandidatePassage, CorpusId, PaperAggregate, PaperRecord, PassageKey, RerankedPassage,
    SnippetKind,
};
pub use query::{DecomposedQuery, RetrievalFilters, YearRange};
pub use quote::{QuoteHandle, QuoteSet};
pub use section::{Citation, GeneratedSection};
pub use table::{Cell, Column, Row, Table};
pub use task::{
    CostRecord, ModelUsage, Step, Task, TaskId, TaskResult, TaskStateDoc, TaskStatus, TimingRecord,
};
