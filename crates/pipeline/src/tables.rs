//! Comparison-table building for list-formatted sections.
//!
//! Three sub-stages: column proposal, per-cell extraction over paper
//! abstracts, and per-column value normalization. Every sub-step degrades
//! gracefully: no columns means no table, a failed cell becomes "N/A", and
//! failed normalization keeps the raw values.

use std::sync::Arc;

use futures::future::FutureExt;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use scholarqa_config::TablesConfig;
use scholarqa_core::{
    CancelToken, Cell, Column, PaperAggregate, QuoteSet, Row, SectionFormat, SectionPlan, Table,
};
use scholarqa_llm::{CompletionOptions, LlmError, ModelChain, ModelClient};
use serde::Deserialize;

use crate::cost::CostLedger;
use crate::{prompts, schemas, PipelineError};

const MAX_CELL_WORDS: usize = 10;

pub struct TableBuilder {
    client: Arc<ModelClient>,
    chain: ModelChain,
    config: TablesConfig,
    max_workers: usize,
}

impl TableBuilder {
    pub fn new(
        client: Arc<ModelClient>,
        chain: ModelChain,
        config: TablesConfig,
        max_workers: usize,
    ) -> Self {
        Self {
            client,
            chain,
            config,
            max_workers: max_workers.max(1),
        }
    }

    /// List sections citing enough papers get a table.
    pub fn should_build(&self, plan: &SectionPlan) -> bool {
        plan.format == SectionFormat::List && plan.references().len() >= self.config.min_papers
    }

    /// Best-effort table construction. Only cancellation is an error;
    /// every other failure returns `None` or a partial table plus warnings.
    pub async fn build(
        &self,
        query: &str,
        plan: &SectionPlan,
        papers: &[PaperAggregate],
        quotes: &[QuoteSet],
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<(Option<Table>, Vec<String>), PipelineError> {
        let mut warnings = Vec::new();

        let mut cited: Vec<&PaperAggregate> = plan
            .references()
            .into_iter()
            .filter_map(|r| papers.iter().find(|p| p.reference == r))
            .collect();
        if cited.len() > self.config.max_rows {
            warnings.push(format!(
                "section {:?}: table truncated to {} rows",
                plan.name, self.config.max_rows
            ));
            cited.truncate(self.config.max_rows);
        }

        let columns = match self.propose_columns(query, plan, &cited, ledger, cancel).await {
            Ok(columns) => columns,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::warn!(section = %plan.name, error = %e, "column proposal failed, no table");
                warnings.push(format!("section {:?}: no table ({e})", plan.name));
                return Ok((None, warnings));
            }
        };

        let rows: Vec<Row> = cited
            .iter()
            .map(|paper| Row {
                id: format!("r{}", paper.reference),
                corpus_id: paper.corpus_id.clone(),
                label: row_label(paper),
            })
            .collect();

        let mut table = Table {
            columns,
            rows,
            cells: Default::default(),
        };

        self.fill_cells(&mut table, &cited, quotes, &mut warnings, ledger, cancel)
            .await?;
        self.normalize_columns(&mut table, &mut warnings, ledger, cancel)
            .await?;

        table.fill_missing();
        Ok((Some(table), warnings))
    }

    async fn propose_columns(
        &self,
        query: &str,
        plan: &SectionPlan,
        cited: &[&PaperAggregate],
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<Vec<Column>, PipelineError> {
        let options = CompletionOptions {
            max_output_tokens: 512,
            ..Default::default()
        };
        let (value, completion) = self
            .client
            .complete_structured(
                &self.chain,
                &prompts::columns_system(self.config.max_columns),
                &prompts::columns_user(query, &plan.name, cited),
                &options,
                &schemas::columns_schema(),
                cancel,
            )
            .await
            .map_err(map_llm)?;
        ledger.record(&completion);

        let wire: WireColumns = serde_json::from_value(value).unwrap_or_default();
        let mut columns: Vec<Column> = wire
            .columns
            .into_iter()
            .enumerate()
            .map(|(i, c)| Column {
                id: format!("c{}", i + 1),
                name: c.name,
                description: c.description.unwrap_or_default(),
            })
            .collect();
        columns.truncate(self.config.max_columns);
        if columns.is_empty() {
            return Err(PipelineError::Llm(LlmError::MalformedResponse {
                model: completion.model,
                message: "no columns proposed".into(),
            }));
        }
        Ok(columns)
    }

    async fn fill_cells(
        &self,
        table: &mut Table,
        cited: &[&PaperAggregate],
        quotes: &[QuoteSet],
        warnings: &mut Vec<String>,
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        let units: Vec<(Row, Column, &PaperAggregate)> = table
            .rows
            .iter()
            .filter_map(|row| {
                cited
                    .iter()
                    .find(|p| p.corpus_id == row.corpus_id)
                    .map(|paper| (row, *paper))
            })
            .flat_map(|(row, paper)| {
                table
                    .columns
                    .iter()
                    .map(move |col| (row.clone(), col.clone(), paper))
            })
            .collect();

        let mut pending = units.iter();
        let mut in_flight = FuturesUnordered::new();
        let make_fut = |(row, col, paper): &(Row, Column, &PaperAggregate)| {
            let row_id = row.id.clone();
            let col_id = col.id.clone();
            self.fill_one_cell(col, paper, quotes, ledger, cancel)
                .map(move |res| res.map(|cell| (row_id, col_id, cell)))
        };
        for unit in pending.by_ref().take(self.max_workers) {
            in_flight.push(make_fut(unit));
        }
        let mut results: Vec<Result<(String, String, Cell), PipelineError>> = Vec::new();
        while let Some(result) = in_flight.next().await {
            results.push(result);
            if let Some(unit) = pending.next() {
                in_flight.push(make_fut(unit));
            }
        }

        for result in results {
            match result {
                Ok((row_id, col_id, cell)) => table.set(&row_id, &col_id, cell),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => warnings.push(format!("table cell failed: {e}")),
            }
        }
        Ok(())
    }

    fn fill_one_cell<'a>(
        &'a self,
        column: &'a Column,
        paper: &'a PaperAggregate,
        quotes: &'a [QuoteSet],
        ledger: &'a CostLedger,
        cancel: &'a CancelToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Cell, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
        cancel.check().map_err(|_| PipelineError::Cancelled)?;

        let source = paper
            .record
            .abstract_text
            .as_deref()
            .unwrap_or(&paper.merged_text);
        let options = CompletionOptions {
            max_output_tokens: 64,
            ..Default::default()
        };

        let (value, completion) = self
            .client
            .complete_structured(
                &self.chain,
                &prompts::cell_system(),
                &prompts::cell_user(&column.name, &column.description, source),
                &options,
                &schemas::cell_schema(),
                cancel,
            )
            .await
            .map_err(map_llm)?;
        ledger.record(&completion);

        let wire: WireCell = serde_json::from_value(value).unwrap_or_default();
        let evidence = wire
            .evidence_quote_id
            .and_then(|id| id.parse().ok())
            .filter(|handle: &scholarqa_core::QuoteHandle| {
                handle.reference == paper.reference
                    && quotes
                        .iter()
                        .any(|set| set.get(*handle).is_some())
            });

        Ok(Cell {
            value: clamp_words(&wire.value, MAX_CELL_WORDS),
            evidence,
        })
        })
    }

    async fn normalize_columns(
        &self,
        table: &mut Table,
        warnings: &mut Vec<String>,
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        let columns = table.columns.clone();
        let row_ids: Vec<String> = table.rows.iter().map(|r| r.id.clone()).collect();

        for column in &columns {
            cancel.check().map_err(|_| PipelineError::Cancelled)?;

            let values: Vec<String> = row_ids
                .iter()
                .map(|row_id| {
                    table
                        .get(row_id, &column.id)
                        .map(|c| c.value.clone())
                        .unwrap_or_else(|| "N/A".to_string())
                })
                .collect();

            let options = CompletionOptions {
                max_output_tokens: 256,
                ..Default::default()
            };
            let result = self
                .client
                .complete_structured(
                    &self.chain,
                    &prompts::normalize_system(),
                    &prompts::normalize_user(&column.name, &values),
                    &options,
                    &schemas::normalize_schema(),
                    cancel,
                )
                .await;

            match result {
                Ok((value, completion)) => {
                    ledger.record(&completion);
                    let wire: WireNormalized = serde_json::from_value(value).unwrap_or_default();
                    if wire.values.len() == row_ids.len() {
                        for (row_id, normalized) in row_ids.iter().zip(wire.values) {
                            if let Some(existing) = table.get(row_id, &column.id) {
                                let evidence = existing.evidence;
                                table.set(
                                    row_id,
                                    &column.id,
                                    Cell {
                                        value: normalized,
                                        evidence,
                                    },
                                );
                            }
                        }
                    } else {
                        warnings.push(format!(
                            "column {:?}: normalization returned {} values for {} rows; raw values kept",
                            column.name,
                            wire.values.len(),
                            row_ids.len()
                        ));
                    }
                }
                Err(LlmError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::warn!(column = %column.name, error = %e, "normalization failed, raw values kept");
                    warnings.push(format!(
                        "column {:?}: normalization failed; raw values kept",
                        column.name
                    ));
                }
            }
        }
        Ok(())
    }
}

fn map_llm(err: LlmError) -> PipelineError {
    match err {
        LlmError::Cancelled => PipelineError::Cancelled,
        other => PipelineError::Llm(other),
    }
}

/// "First-author Year" label, falling back to the title.
fn row_label(paper: &PaperAggregate) -> String {
    match (paper.record.authors.first(), paper.record.year) {
        (Some(author), Some(year)) => {
            let surname = author.name.split_whitespace().last().unwrap_or(&author.name);
            format!("{surname} {year}")
        }
        (Some(author), None) => author.name.clone(),
        _ => paper.record.title.clone(),
    }
}

fn clamp_words(value: &str, max_words: usize) -> String {
    let words: Vec<&str> = value.split_whitespace().collect();
    if words.len() <= max_words {
        value.trim().to_string()
    } else {
        words[..max_words].join(" ")
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireColumns {
    #[serde(default)]
    columns: Vec<WireColumn>,
}

#[derive(Debug, Deserialize)]
struct WireColumn {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCell {
    value: String,
    #[serde(default)]
    evidence_quote_id: Option<String>,
}

impl Default for WireCell {
    fn default() -> Self {
        Self {
            value: "N/A".to_string(),
            evidence_quote_id: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireNormalized {
    #[serde(default)]
    values: Vec<String>,
}
