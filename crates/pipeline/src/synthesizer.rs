//! Section synthesis stage.
//!
//! Sections are generated strictly in outline order; each call carries the
//! tail of the previously generated prose for continuity. Citation markers
//! must resolve to reference numbers assigned to the section; unresolved
//! markers are stripped and logged. A failed section degrades to a short
//! deterministic fallback instead of aborting the task.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use scholarqa_core::{
    cite, CancelToken, Citation, GeneratedSection, Outline, PaperAggregate, QuoteSet,
};
use scholarqa_llm::{CompletionOptions, LlmError, ModelChain, ModelClient};

use crate::cost::CostLedger;
use crate::{prompts, PipelineError};

const FALLBACK_TEXT: &str = "This section could not be generated.";

#[derive(Debug)]
pub struct SynthOutcome {
    pub sections: Vec<GeneratedSection>,
    pub warnings: Vec<String>,
}

pub struct SectionSynthesizer {
    client: Arc<ModelClient>,
    chain: ModelChain,
    context_tail_chars: usize,
}

impl SectionSynthesizer {
    pub fn new(client: Arc<ModelClient>, chain: ModelChain, context_tail_chars: usize) -> Self {
        Self {
            client,
            chain,
            context_tail_chars,
        }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        outline: &Outline,
        quotes: &[QuoteSet],
        papers: &[PaperAggregate],
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<SynthOutcome, PipelineError> {
        let by_reference: HashMap<u32, &PaperAggregate> =
            papers.iter().map(|p| (p.reference, p)).collect();
        let quote_lookup: HashMap<u32, &QuoteSet> =
            quotes.iter().map(|set| (set.reference, set)).collect();

        let mut sections = Vec::with_capacity(outline.sections.len());
        let mut warnings = Vec::new();
        let mut prior_text = String::new();

        for plan in &outline.sections {
            cancel.check().map_err(|_| PipelineError::Cancelled)?;

            let section_quotes: Vec<(String, String)> = plan
                .quotes
                .iter()
                .filter_map(|handle| {
                    quote_lookup
                        .get(&handle.reference)
                        .and_then(|set| set.get(*handle))
                        .map(|quote| (handle.reference.to_string(), quote.to_string()))
                })
                .collect();

            let prior_tail = tail_chars(&prior_text, self.context_tail_chars);
            let options = CompletionOptions {
                max_output_tokens: 1024,
                temperature: 0.4,
                ..Default::default()
            };

            let result = self
                .client
                .complete(
                    &self.chain,
                    &prompts::synthesize_system(),
                    &prompts::synthesize_user(query, plan, &section_quotes, prior_tail),
                    &options,
                    cancel,
                )
                .await;

            let section = match result {
                Ok(completion) => {
                    ledger.record(&completion);
                    let (tldr, body) = split_tldr(&completion.text);
                    let allowed: BTreeSet<u32> = plan.references().into_iter().collect();
                    let (text, stripped) = cite::strip_unresolved_markers(&body, &allowed);
                    if !stripped.is_empty() {
                        tracing::warn!(
                            section = %plan.name,
                            ?stripped,
                            "stripped unresolved citation markers"
                        );
                        warnings.push(format!(
                            "section {:?}: stripped unresolved citation markers {:?}",
                            plan.name, stripped
                        ));
                    }

                    let citations = cite::extract_markers(&text)
                        .into_iter()
                        .filter_map(|n| {
                            by_reference.get(&n).map(|paper| Citation {
                                id: n.to_string(),
                                corpus_id: paper.corpus_id.clone(),
                                paper: paper.record.clone(),
                            })
                        })
                        .collect();

                    GeneratedSection {
                        title: plan.name.clone(),
                        format: plan.format,
                        tldr,
                        text,
                        citations,
                        table: None,
                    }
                }
                Err(LlmError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::warn!(section = %plan.name, error = %e, "section synthesis failed");
                    warnings.push(format!("section {:?} could not be generated: {e}", plan.name));
                    GeneratedSection {
                        title: plan.name.clone(),
                        format: plan.format,
                        tldr: None,
                        text: FALLBACK_TEXT.to_string(),
                        citations: Vec::new(),
                        table: None,
                    }
                }
            };

            if section.text != FALLBACK_TEXT {
                prior_text.push_str(&section.text);
                prior_text.push('\n');
            }
            sections.push(section);
        }

        Ok(SynthOutcome { sections, warnings })
    }
}

/// Last `k` characters of `s`, on a char boundary.
fn tail_chars(s: &str, k: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= k {
        return s;
    }
    let skip = char_count - k;
    let (idx, _) = s.char_indices().nth(skip).unwrap_or((0, ' '));
    &s[idx..]
}

/// Pull an optional leading "TLDR: ..." line off the completion.
fn split_tldr(text: &str) -> (Option<String>, String) {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("TLDR:") {
        if let Some((first_line, body)) = rest.split_once('\n') {
            return (
                Some(first_line.trim().to_string()),
                body.trim().to_string(),
            );
        }
        // TLDR-only output is the body too.
        return (Some(rest.trim().to_string()), rest.trim().to_string());
    }
    (None, trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_chars_respects_boundaries() {
        assert_eq!(tail_chars("hello", 10), "hello");
        assert_eq!(tail_chars("hello", 3), "llo");
        // Multi-byte characters must not be split.
        assert_eq!(tail_chars("héllo", 4), "éllo");
    }

    #[test]
    fn test_split_tldr() {
        let (tldr, body) = split_tldr("TLDR: short answer\nThe long answer [1].");
        assert_eq!(tldr.as_deref(), Some("short answer"));
        assert_eq!(body, "The long answer [1].");

        let (tldr, body) = split_tldr("Just prose [2].");
        assert!(tldr.is_none());
        assert_eq!(body, "Just prose [2].");
    }
}
