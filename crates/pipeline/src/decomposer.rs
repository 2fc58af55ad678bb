//! Query decomposition stage.

use std::collections::BTreeSet;
use std::sync::Arc;

use scholarqa_core::{CancelToken, DecomposedQuery, RetrievalFilters, YearRange};
use scholarqa_llm::{CompletionOptions, LlmError, ModelChain, ModelClient};
use serde::Deserialize;

use crate::cost::CostLedger;
use crate::{prompts, schemas, PipelineError};

/// Decomposition result; `degraded` marks the trivial fallback.
#[derive(Debug)]
pub struct DecomposeOutcome {
    pub query: DecomposedQuery,
    pub degraded: bool,
    pub warnings: Vec<String>,
}

pub struct QueryDecomposer {
    client: Arc<ModelClient>,
    chain: ModelChain,
}

impl QueryDecomposer {
    pub fn new(client: Arc<ModelClient>, chain: ModelChain) -> Self {
        Self { client, chain }
    }

    pub async fn decompose(
        &self,
        query: &str,
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<DecomposeOutcome, PipelineError> {
        let options = CompletionOptions {
            max_output_tokens: 512,
            ..Default::default()
        };

        let result = self
            .client
            .complete_structured(
                &self.chain,
                &prompts::decompose_system(),
                &prompts::decompose_user(query),
                &options,
                &schemas::decompose_schema(),
                cancel,
            )
            .await;

        match result {
            Ok((value, completion)) => {
                ledger.record(&completion);
                match serde_json::from_value::<WireDecomposition>(value) {
                    Ok(wire) => Ok(DecomposeOutcome {
                        query: wire.into_decomposed(),
                        degraded: false,
                        warnings: Vec::new(),
                    }),
                    Err(e) => {
                        // Schema passed but our own shape didn't; degrade.
                        tracing::warn!(error = %e, "decomposition shape mismatch, using trivial form");
                        Ok(DecomposeOutcome {
                            query: DecomposedQuery::trivial(query),
                            degraded: true,
                            warnings: vec![format!("query decomposition degraded: {e}")],
                        })
                    }
                }
            }
            Err(LlmError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                // Any model failure degrades to the trivial decomposition.
                tracing::warn!(error = %e, "query decomposition degraded to trivial form");
                Ok(DecomposeOutcome {
                    query: DecomposedQuery::trivial(query),
                    degraded: true,
                    warnings: vec![format!("query decomposition degraded: {e}")],
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireDecomposition {
    rewritten_query: String,
    keyword_query: String,
    #[serde(default)]
    filters: WireFilters,
}

#[derive(Debug, Default, Deserialize)]
struct WireFilters {
    #[serde(default)]
    start_year: Option<i32>,
    #[serde(default)]
    end_year: Option<i32>,
    #[serde(default)]
    venues: Vec<String>,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    fields_of_study: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

impl WireDecomposition {
    fn into_decomposed(self) -> DecomposedQuery {
        let years = if self.filters.start_year.is_some() || self.filters.end_year.is_some() {
            Some(YearRange {
                start: self.filters.start_year,
                // Inclusive on the wire, half-open internally.
                end: self.filters.end_year.map(|y| y + 1),
            })
        } else {
            None
        };
        DecomposedQuery {
            rewritten: self.rewritten_query,
            keywords: self.keyword_query,
            filters: RetrievalFilters {
                years,
                venues: to_set(self.filters.venues),
                authors: to_set(self.filters.authors),
                fields_of_study: to_set(self.filters.fields_of_study),
                limit: self.filters.limit,
            },
        }
    }
}

fn to_set(values: Vec<String>) -> BTreeSet<String> {
    values.into_iter().filter(|v| !v.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_decomposition_maps_half_open_years() {
        let wire: WireDecomposition = serde_json::from_str(
            r#"{
                "rewritten_query": "evidence for a ninth planet",
                "keyword_query": "planet nine",
                "filters": {"start_year": 2016, "end_year": 2022, "venues": ["AJ"]}
            }"#,
        )
        .unwrap();
        let decomposed = wire.into_decomposed();
        let years = decomposed.filters.years.unwrap();
        assert_eq!(years.start, Some(2016));
        assert_eq!(years.end, Some(2023));
        assert!(years.contains(2022));
        assert!(!years.contains(2023));
        assert!(decomposed.filters.venues.contains("AJ"));
    }

    #[test]
    fn test_wire_decomposition_without_filters() {
        let wire: WireDecomposition = serde_json::from_str(
            r#"{"rewritten_query": "a", "keyword_query": "b"}"#,
        )
        .unwrap();
        let decomposed = wire.into_decomposed();
        assert!(decomposed.filters.is_empty());
    }
}
