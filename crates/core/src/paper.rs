//! Paper and passage types produced by retrieval.

use serde::{Deserialize, Serialize};

/// Opaque paper identifier assigned by the external index.
pub type CorpusId = String;

/// Where in the paper a snippet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnippetKind {
    Abstract,
    Body,
    Title,
    Other,
}

/// A short span of paper text returned by the index, before reranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePassage {
    pub corpus_id: CorpusId,
    pub text: String,
    /// Section heading the snippet was taken from, when the index knows it.
    pub section: Option<String>,
    pub kind: SnippetKind,
    /// Retrieval score as reported by the index.
    pub score: f32,
    /// Character offsets within the source document.
    pub offsets: Option<(usize, usize)>,
}

impl CandidatePassage {
    /// Snippets are unique per paper location.
    pub fn key(&self) -> PassageKey {
        PassageKey {
            corpus_id: self.corpus_id.clone(),
            offsets: self.offsets,
        }
    }
}

/// Dedup key for candidate passages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PassageKey {
    pub corpus_id: CorpusId,
    pub offsets: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    /// Opaque author id from the index, when present.
    pub author_id: Option<String>,
}

/// Paper metadata from the index. Immutable once fetched within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub corpus_id: CorpusId,
    pub title: String,
    pub authors: Vec<Author>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub citation_count: Option<u64>,
    pub influential_citation_count: Option<u64>,
    pub open_access: Option<bool>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
}

impl PaperRecord {
    /// Placeholder record for a corpus id the metadata endpoint did not return.
    pub fn unknown(corpus_id: &str) -> Self {
        Self {
            corpus_id: corpus_id.to_string(),
            title: format!("Unknown paper {corpus_id}"),
            authors: Vec::new(),
            year: None,
            venue: None,
            citation_count: None,
            influential_citation_count: None,
            open_access: None,
            abstract_text: None,
        }
    }
}

/// A candidate passage with its rerank score in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedPassage {
    pub passage: CandidatePassage,
    pub rerank_score: f32,
}

/// Merged view of all kept passages for one paper within a task.
///
/// Reference numbers are dense, assigned from 1 in descending aggregate
/// score order, and unique per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAggregate {
    pub corpus_id: CorpusId,
    pub reference: u32,
    pub record: PaperRecord,
    /// Kept passages concatenated in deterministic order.
    pub merged_text: String,
    /// Max rerank score over the kept passages.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passage_key_distinguishes_offsets() {
        let mut a = CandidatePassage {
            corpus_id: "c1".into(),
            text: "x".into(),
            section: None,
            kind: SnippetKind::Body,
            score: 0.5,
            offsets: Some((0, 10)),
        };
        let k1 = a.key();
        a.offsets = Some((10, 20));
        let k2 = a.key();
        assert_ne!(k1, k2);
        assert_eq!(k1, k1.clone());
    }

    #[test]
    fn test_snippet_kind_wire_form() {
        assert_eq!(
            serde_json::to_string(&SnippetKind::Abstract).unwrap(),
            "\"abstract\""
        );
    }
}
