//! Paper finder: retrieve, dedupe, rerank, aggregate.
//!
//! Turns a decomposed query into ranked paper aggregates with dense
//! reference numbers. Snippet and keyword search run in parallel; a
//! permanent snippet-search failure fails the stage, every other upstream
//! failure degrades with a recorded warning.

use std::collections::HashMap;
use std::sync::Arc;

use scholarqa_config::{PaperFinderConfig, RetrievalConfig};
use scholarqa_core::{
    CancelToken, CandidatePassage, CorpusId, DecomposedQuery, PaperAggregate, PaperRecord,
    PassageKey, RerankedPassage, SnippetKind,
};

use crate::metadata_cache::MetadataCache;
use crate::paper_index::PaperIndex;
use crate::reranker::Reranker;
use crate::RetrievalError;

/// Separator between passages in a paper's merged text.
const PASSAGE_SEPARATOR: &str = "\n\n";

/// Retrieval score assigned to synthetic abstract passages, which arrive
/// from keyword search without one.
const SYNTHETIC_PASSAGE_SCORE: f32 = 0.5;

/// Ranked aggregates plus the warnings accumulated on degraded paths.
#[derive(Debug)]
pub struct FinderOutput {
    pub papers: Vec<PaperAggregate>,
    pub warnings: Vec<String>,
}

pub struct PaperFinder {
    index: Arc<dyn PaperIndex>,
    reranker: Arc<dyn Reranker>,
    metadata_cache: Arc<MetadataCache>,
    retrieval: RetrievalConfig,
    finder: PaperFinderConfig,
}

impl PaperFinder {
    pub fn new(
        index: Arc<dyn PaperIndex>,
        reranker: Arc<dyn Reranker>,
        metadata_cache: Arc<MetadataCache>,
        retrieval: RetrievalConfig,
        finder: PaperFinderConfig,
    ) -> Self {
        Self {
            index,
            reranker,
            metadata_cache,
            retrieval,
            finder,
        }
    }

    pub async fn find(
        &self,
        query: &DecomposedQuery,
        cancel: &CancelToken,
    ) -> Result<FinderOutput, RetrievalError> {
        let mut warnings = Vec::new();

        // Both query forms fan out in parallel. An explicit result limit in
        // the filters can only tighten the configured ceiling.
        let snippet_limit = query
            .filters
            .limit
            .map_or(self.retrieval.n_retrieval, |l| {
                l.min(self.retrieval.n_retrieval)
            });
        let (snippets, keyword_papers) = tokio::join!(
            self.index.snippet_search(
                &query.rewritten,
                &query.filters,
                snippet_limit,
                cancel,
            ),
            self.index.keyword_search(
                &query.keywords,
                &query.filters,
                self.retrieval.n_keyword_srch,
                cancel,
            ),
        );

        let snippets = snippets.map_err(|e| match e {
            RetrievalError::Cancelled => RetrievalError::Cancelled,
            other => RetrievalError::RetrievalUnavailable(other.to_string()),
        })?;

        let keyword_papers = match keyword_papers {
            Ok(papers) => papers,
            Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "keyword search failed, continuing with snippets only");
                warnings.push(format!("keyword search unavailable: {e}"));
                Vec::new()
            }
        };

        // Dedupe by (corpus id, offsets); snippet search wins ties, so it
        // populates the map first.
        let mut by_key: HashMap<PassageKey, CandidatePassage> = HashMap::new();
        for passage in snippets {
            by_key.entry(passage.key()).or_insert(passage);
        }

        let mut known_records: HashMap<CorpusId, PaperRecord> = HashMap::new();
        for record in keyword_papers {
            let has_snippet = by_key.keys().any(|k| k.corpus_id == record.corpus_id);
            if !has_snippet {
                if let Some(abstract_text) = &record.abstract_text {
                    let synthetic = CandidatePassage {
                        corpus_id: record.corpus_id.clone(),
                        text: abstract_text.clone(),
                        section: None,
                        kind: SnippetKind::Abstract,
                        score: SYNTHETIC_PASSAGE_SCORE,
                        offsets: None,
                    };
                    by_key.entry(synthetic.key()).or_insert(synthetic);
                }
            }
            self.metadata_cache.insert(record.clone());
            known_records.insert(record.corpus_id.clone(), record);
        }

        if by_key.is_empty() {
            return Ok(FinderOutput {
                papers: Vec::new(),
                warnings,
            });
        }

        // Deterministic passage order for reranking and merging.
        let mut passages: Vec<CandidatePassage> = by_key.into_values().collect();
        passages.sort_by(|a, b| {
            a.corpus_id
                .cmp(&b.corpus_id)
                .then(a.offsets.cmp(&b.offsets))
                .then(a.text.cmp(&b.text))
        });

        self.fill_metadata(&passages, &mut known_records, cancel)
            .await?;

        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let scores = match self.reranker.score(&query.rewritten, &texts, cancel).await {
            Ok(scores) if scores.len() == texts.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    got = scores.len(),
                    expected = texts.len(),
                    "misaligned rerank scores, falling back to retrieval order"
                );
                warnings.push("reranker returned misaligned scores; using retrieval order".into());
                normalize_retrieval_scores(&passages)
            }
            Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "reranker unavailable, falling back to retrieval order");
                warnings.push(format!("reranker unavailable ({e}); using retrieval order"));
                normalize_retrieval_scores(&passages)
            }
        };

        let kept: Vec<RerankedPassage> = passages
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| *score >= self.finder.context_threshold)
            .map(|(passage, rerank_score)| RerankedPassage {
                passage,
                rerank_score,
            })
            .collect();

        let papers = self.aggregate(kept, &known_records);
        Ok(FinderOutput { papers, warnings })
    }

    /// Resolve metadata for every corpus id, via cache then batch fetch.
    async fn fill_metadata(
        &self,
        passages: &[CandidatePassage],
        known: &mut HashMap<CorpusId, PaperRecord>,
        cancel: &CancelToken,
    ) -> Result<(), RetrievalError> {
        let mut missing: Vec<CorpusId> = Vec::new();
        for passage in passages {
            if known.contains_key(&passage.corpus_id) || missing.contains(&passage.corpus_id) {
                continue;
            }
            if let Some(record) = self.metadata_cache.get(&passage.corpus_id) {
                known.insert(passage.corpus_id.clone(), record);
            } else {
                missing.push(passage.corpus_id.clone());
            }
        }

        if !missing.is_empty() {
            match self.index.fetch_metadata(&missing, cancel).await {
                Ok(fetched) => {
                    for (corpus_id, record) in fetched {
                        self.metadata_cache.insert(record.clone());
                        known.insert(corpus_id, record);
                    }
                }
                Err(RetrievalError::Cancelled) => return Err(RetrievalError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, "metadata fetch failed, using placeholders");
                }
            }
        }
        Ok(())
    }

    /// Group kept passages by paper, merge texts, rank and number papers.
    fn aggregate(
        &self,
        kept: Vec<RerankedPassage>,
        records: &HashMap<CorpusId, PaperRecord>,
    ) -> Vec<PaperAggregate> {
        let mut by_paper: HashMap<CorpusId, Vec<RerankedPassage>> = HashMap::new();
        for passage in kept {
            by_paper
                .entry(passage.passage.corpus_id.clone())
                .or_default()
                .push(passage);
        }

        let mut papers: Vec<PaperAggregate> = by_paper
            .into_iter()
            .map(|(corpus_id, mut passages)| {
                passages.sort_by(|a, b| {
                    b.rerank_score
                        .total_cmp(&a.rerank_score)
                        .then(a.passage.offsets.cmp(&b.passage.offsets))
                });
                passages.truncate(self.finder.passages_per_paper);

                let score = passages
                    .iter()
                    .map(|p| p.rerank_score)
                    .fold(0.0f32, f32::max);
                let merged_text = passages
                    .iter()
                    .map(|p| p.passage.text.as_str())
                    .collect::<Vec<_>>()
                    .join(PASSAGE_SEPARATOR);
                let record = records
                    .get(&corpus_id)
                    .cloned()
                    .unwrap_or_else(|| PaperRecord::unknown(&corpus_id));

                PaperAggregate {
                    corpus_id,
                    reference: 0,
                    record,
                    merged_text,
                    score,
                }
            })
            .collect();

        papers.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.corpus_id.cmp(&b.corpus_id))
        });
        papers.truncate(self.finder.n_rerank);
        for (i, paper) in papers.iter_mut().enumerate() {
            paper.reference = (i + 1) as u32;
        }
        papers
    }
}

/// Min-max normalize retrieval scores into `[0, 1]`, preserving order.
fn normalize_retrieval_scores(passages: &[CandidatePassage]) -> Vec<f32> {
    let min = passages.iter().map(|p| p.score).fold(f32::INFINITY, f32::min);
    let max = passages
        .iter()
        .map(|p| p.score)
        .fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f32::EPSILON {
        return vec![1.0; passages.len()];
    }
    passages
        .iter()
        .map(|p| (p.score - min) / (max - min))
        .collect()
}
