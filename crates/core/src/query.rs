//! Decomposed query and retrieval filters.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Half-open publication-year interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: Option<i32>,
    pub end: Option<i32>,
}

impl YearRange {
    pub fn contains(&self, year: i32) -> bool {
        self.start.map_or(true, |s| year >= s) && self.end.map_or(true, |e| year < e)
    }
}

/// Structured retrieval filters extracted from the user question.
/// Every field is optional; sets are unordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    #[serde(default)]
    pub years: Option<YearRange>,
    #[serde(default)]
    pub venues: BTreeSet<String>,
    #[serde(default)]
    pub authors: BTreeSet<String>,
    #[serde(default)]
    pub fields_of_study: BTreeSet<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RetrievalFilters {
    pub fn is_empty(&self) -> bool {
        self.years.is_none()
            && self.venues.is_empty()
            && self.authors.is_empty()
            && self.fields_of_study.is_empty()
            && self.limit.is_none()
    }
}

/// Output of the query decomposition stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposedQuery {
    /// Query rewritten for passage-level search.
    pub rewritten: String,
    /// Keyword form for paper-level search.
    pub keywords: String,
    #[serde(default)]
    pub filters: RetrievalFilters,
}

impl DecomposedQuery {
    /// Degraded decomposition: both query forms are the original question.
    pub fn trivial(query: &str) -> Self {
        Self {
            rewritten: query.to_string(),
            keywords: query.to_string(),
            filters: RetrievalFilters::default(),
        }
    }
}
