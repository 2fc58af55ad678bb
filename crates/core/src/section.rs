//! Generated sections and resolved citations.

use serde::{Deserialize, Serialize};

use crate::outline::SectionFormat;
use crate::paper::{CorpusId, PaperRecord};
use crate::table::Table;

/// A citation marker resolved to its paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// Marker id as it appears in the text, e.g. `"3"` for `[3]`.
    pub id: String,
    pub corpus_id: CorpusId,
    pub paper: PaperRecord,
}

/// One synthesized section of the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSection {
    pub title: String,
    pub format: SectionFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tldr: Option<String>,
    /// Prose containing inline citation markers.
    pub text: String,
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Table>,
}
