//! Outline planning stage.
//!
//! One structured call groups the flat quote list into named, typed
//! sections. Validation drops unknown quote ids, disambiguates duplicate
//! names, removes empty sections and notes unplaced quotes. Schema
//! violations degrade to a single "Summary" section holding every quote in
//! reference order.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use scholarqa_core::{CancelToken, Outline, QuoteHandle, QuoteSet, SectionFormat, SectionPlan};
use scholarqa_llm::{CompletionOptions, LlmError, ModelChain, ModelClient};
use serde::Deserialize;

use crate::cost::CostLedger;
use crate::{prompts, schemas, PipelineError};

#[derive(Debug)]
pub struct PlanOutcome {
    pub outline: Outline,
    pub degraded: bool,
    pub warnings: Vec<String>,
}

pub struct OutlinePlanner {
    client: Arc<ModelClient>,
    chain: ModelChain,
}

impl OutlinePlanner {
    pub fn new(client: Arc<ModelClient>, chain: ModelChain) -> Self {
        Self { client, chain }
    }

    pub async fn plan(
        &self,
        query: &str,
        quotes: &[QuoteSet],
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<PlanOutcome, PipelineError> {
        if quotes.is_empty() {
            return Err(PipelineError::NoQuotes);
        }

        let options = CompletionOptions {
            max_output_tokens: 1024,
            ..Default::default()
        };

        let result = self
            .client
            .complete_structured(
                &self.chain,
                &prompts::plan_system(),
                &prompts::plan_user(query, quotes),
                &options,
                &schemas::plan_schema(),
                cancel,
            )
            .await;

        match result {
            Ok((value, completion)) => {
                ledger.record(&completion);
                let wire: WireOutline = serde_json::from_value(value).unwrap_or_default();
                Ok(validate_outline(wire, quotes))
            }
            Err(LlmError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "outline planning degraded to single section");
                Ok(PlanOutcome {
                    outline: fallback_outline(quotes),
                    degraded: true,
                    warnings: vec![format!("outline planning degraded: {e}")],
                })
            }
        }
    }
}

/// Single-section plan with every quote in reference order.
fn fallback_outline(quotes: &[QuoteSet]) -> Outline {
    Outline {
        sections: vec![SectionPlan {
            name: "Summary".to_string(),
            format: SectionFormat::Synthesis,
            quotes: quotes.iter().flat_map(|set| set.handles()).collect(),
        }],
    }
}

fn validate_outline(wire: WireOutline, quotes: &[QuoteSet]) -> PlanOutcome {
    let known: HashSet<QuoteHandle> = quotes.iter().flat_map(|set| set.handles()).collect();
    let mut warnings = Vec::new();
    let mut placed: HashSet<QuoteHandle> = HashSet::new();
    let mut used_names: BTreeMap<String, usize> = BTreeMap::new();
    let mut sections = Vec::new();

    for wire_section in wire.sections {
        let mut handles = Vec::new();
        for id in &wire_section.quote_ids {
            match id.parse::<QuoteHandle>() {
                Ok(handle) if known.contains(&handle) => {
                    // A quote appears in exactly one section; first placement wins.
                    if placed.insert(handle) {
                        handles.push(handle);
                    } else {
                        warnings.push(format!(
                            "quote {handle} assigned to more than one section; kept first"
                        ));
                    }
                }
                Ok(handle) => {
                    warnings.push(format!("outline referenced unknown quote {handle}; dropped"));
                }
                Err(_) => {
                    warnings.push(format!("outline referenced malformed quote id {id:?}; dropped"));
                }
            }
        }

        if handles.is_empty() {
            warnings.push(format!("section {:?} had no valid quotes; removed", wire_section.name));
            continue;
        }

        let name = dedupe_name(&wire_section.name, &mut used_names);
        sections.push(SectionPlan {
            name,
            format: match wire_section.format.as_str() {
                "list" => SectionFormat::List,
                _ => SectionFormat::Synthesis,
            },
            quotes: handles,
        });
    }

    let unplaced: Vec<QuoteHandle> = {
        let mut v: Vec<_> = known.difference(&placed).copied().collect();
        v.sort();
        v
    };
    if !unplaced.is_empty() {
        warnings.push(format!(
            "{} quote(s) not placed by the outline were dropped",
            unplaced.len()
        ));
    }

    if sections.is_empty() {
        warnings.push("outline had no usable sections; using single-section fallback".to_string());
        return PlanOutcome {
            outline: fallback_outline(quotes),
            degraded: true,
            warnings,
        };
    }

    PlanOutcome {
        outline: Outline { sections },
        degraded: false,
        warnings,
    }
}

fn dedupe_name(name: &str, used: &mut BTreeMap<String, usize>) -> String {
    let count = used.entry(name.to_string()).or_insert(0);
    *count += 1;
    if *count == 1 {
        name.to_string()
    } else {
        format!("{name} ({count})")
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireOutline {
    #[serde(default)]
    sections: Vec<WireSection>,
}

#[derive(Debug, Deserialize)]
struct WireSection {
    name: String,
    format: String,
    #[serde(default)]
    quote_ids: Vec<String>,
}
