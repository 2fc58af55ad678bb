//! Outline produced by the planner.

use serde::{Deserialize, Serialize};

use crate::quote::QuoteHandle;

/// How a planned section should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionFormat {
    /// Prose paragraph.
    Synthesis,
    /// Enumerated comparison, eligible for a table.
    List,
}

/// One planned section: a unique name, a format, and the quotes assigned
/// to it in presentation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionPlan {
    pub name: String,
    pub format: SectionFormat,
    pub quotes: Vec<QuoteHandle>,
}

impl SectionPlan {
    /// Reference numbers cited by this section, deduplicated, ascending.
    pub fn references(&self) -> Vec<u32> {
        let mut refs: Vec<u32> = self.quotes.iter().map(|q| q.reference).collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

/// Ordered list of section plans. Section order here is the order of the
/// final result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outline {
    pub sections: Vec<SectionPlan>,
}

impl Outline {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
