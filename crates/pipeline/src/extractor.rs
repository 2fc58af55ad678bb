//! Evidence extraction stage.
//!
//! Fans out one model call per paper through a bounded worker pool, keeps
//! only quotes that pass the verbatim substring check, and collates the
//! surviving sets in ascending reference order. A single paper's failure
//! never fails the stage.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use scholarqa_core::{CancelToken, PaperAggregate, QuoteSet};
use scholarqa_llm::{CompletionOptions, LlmError, ModelChain, ModelClient};
use serde::Deserialize;

use crate::cost::CostLedger;
use crate::{prompts, schemas, PipelineError};

#[derive(Debug)]
pub struct ExtractOutcome {
    /// Quote sets in ascending reference order; quoteless papers dropped.
    pub quotes: Vec<QuoteSet>,
    pub warnings: Vec<String>,
}

pub struct EvidenceExtractor {
    client: Arc<ModelClient>,
    chain: ModelChain,
    max_workers: usize,
}

impl EvidenceExtractor {
    pub fn new(client: Arc<ModelClient>, chain: ModelChain, max_workers: usize) -> Self {
        Self {
            client,
            chain,
            max_workers: max_workers.max(1),
        }
    }

    pub async fn extract(
        &self,
        query: &str,
        papers: &[PaperAggregate],
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<ExtractOutcome, PipelineError> {
        let mut warnings = Vec::new();

        let mut pending = papers.iter();
        let mut in_flight = FuturesUnordered::new();
        for paper in pending.by_ref().take(self.max_workers) {
            in_flight.push(self.extract_one(query, paper, ledger, cancel));
        }
        let mut results: Vec<Result<Option<QuoteSet>, PipelineError>> = Vec::new();
        while let Some(result) = in_flight.next().await {
            results.push(result);
            if let Some(paper) = pending.next() {
                in_flight.push(self.extract_one(query, paper, ledger, cancel));
            }
        }

        let mut quotes = Vec::new();
        for result in results {
            match result {
                Ok(Some(set)) => quotes.push(set),
                Ok(None) => {}
                Err(e) if e.is_cancellation() => return Err(PipelineError::Cancelled),
                Err(e) => {
                    // Already traced inside the worker; keep the note.
                    warnings.push(e.to_string());
                }
            }
        }

        // Workers complete out of order.
        quotes.sort_by_key(|set| set.reference);
        Ok(ExtractOutcome { quotes, warnings })
    }

    fn extract_one<'a>(
        &'a self,
        query: &'a str,
        paper: &'a PaperAggregate,
        ledger: &'a CostLedger,
        cancel: &'a CancelToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<QuoteSet>, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
        cancel.check().map_err(|_| PipelineError::Cancelled)?;

        let options = CompletionOptions {
            max_output_tokens: 1024,
            ..Default::default()
        };

        let (value, completion) = match self
            .client
            .complete_structured(
                &self.chain,
                &prompts::extract_system(),
                &prompts::extract_user(query, paper),
                &options,
                &schemas::extract_schema(),
                cancel,
            )
            .await
        {
            Ok(ok) => ok,
            Err(LlmError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::warn!(
                    reference = paper.reference,
                    corpus_id = %paper.corpus_id,
                    error = %e,
                    "evidence extraction failed for paper, dropping it"
                );
                return Err(PipelineError::Llm(e));
            }
        };
        ledger.record(&completion);

        let wire: WireQuotes = serde_json::from_value(value).unwrap_or_default();
        let mut kept = Vec::new();
        for quote in wire.quotes {
            // Verbatim check against the paper's merged text.
            if paper.merged_text.contains(&quote) {
                kept.push(quote);
            } else {
                tracing::warn!(
                    reference = paper.reference,
                    "discarding non-verbatim quote from extraction"
                );
            }
        }

        if kept.is_empty() {
            tracing::debug!(reference = paper.reference, "paper yielded no quotes");
            return Ok(None);
        }

        Ok(Some(QuoteSet {
            reference: paper.reference,
            corpus_id: paper.corpus_id.clone(),
            quotes: kept,
        }))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireQuotes {
    #[serde(default)]
    quotes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_quotes_tolerates_missing_field() {
        let wire: WireQuotes = serde_json::from_str("{}").unwrap_or_default();
        assert!(wire.quotes.is_empty());
    }
}
