//! Task supervisor.
//!
//! One driver per task: acquires the cross-task admission semaphore, runs
//! the stage sequence with step bookkeeping and per-stage trace records,
//! enforces the wall-clock deadline and routes every terminal outcome into
//! the result store. Synthesis and table building run concurrently, joined
//! before the result document is assembled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use scholarqa_config::Settings;
use scholarqa_core::{
    CancelToken, Error, GeneratedSection, PaperAggregate, QuoteSet, Step, Task, TaskId,
    TaskResult, TaskStatus, TimingRecord,
};
use scholarqa_core::{CostRecord, ModelUsage};
use scholarqa_llm::{ModelChain, ModelClient};
use scholarqa_pipeline::{
    CostLedger, EvidenceExtractor, OutlinePlanner, PipelineError, QueryDecomposer,
    SectionSynthesizer, TableBuilder,
};
use scholarqa_retrieval::PaperFinder;
use tokio::sync::Semaphore;

use crate::estimate::{humanize, stage_estimate, total_estimate, SizeClass};
use crate::store::ResultStore;
use crate::trace::{TraceRecord, TraceWriter};

pub struct TaskSupervisor {
    settings: Settings,
    store: Arc<dyn ResultStore>,
    trace: TraceWriter,
    finder: Arc<PaperFinder>,
    decomposer: QueryDecomposer,
    extractor: EvidenceExtractor,
    planner: OutlinePlanner,
    synthesizer: SectionSynthesizer,
    tables: TableBuilder,
    admission: Arc<Semaphore>,
    cancels: DashMap<String, CancelToken>,
}

impl TaskSupervisor {
    pub fn new(
        settings: Settings,
        client: Arc<ModelClient>,
        finder: Arc<PaperFinder>,
        store: Arc<dyn ResultStore>,
        trace: TraceWriter,
    ) -> Arc<Self> {
        let fallbacks = settings.pipeline.fallback_llm.clone();
        let primary_chain =
            ModelChain::with_fallbacks(settings.pipeline.llm.clone(), fallbacks.clone());
        let decomposer_chain =
            ModelChain::with_fallbacks(settings.decomposer_model().to_string(), fallbacks.clone());
        let tables_chain =
            ModelChain::with_fallbacks(settings.tables_model().to_string(), fallbacks);

        let workers = settings.pipeline.max_llm_workers;
        Arc::new(Self {
            decomposer: QueryDecomposer::new(Arc::clone(&client), decomposer_chain),
            extractor: EvidenceExtractor::new(Arc::clone(&client), primary_chain.clone(), workers),
            planner: OutlinePlanner::new(Arc::clone(&client), primary_chain.clone()),
            synthesizer: SectionSynthesizer::new(
                Arc::clone(&client),
                primary_chain,
                settings.pipeline.context_tail_chars,
            ),
            tables: TableBuilder::new(client, tables_chain, settings.tables.clone(), workers),
            admission: Arc::new(Semaphore::new(settings.tasks.max_concurrent)),
            cancels: DashMap::new(),
            settings,
            store,
            trace,
            finder,
        })
    }

    /// Register the task's cancellation token and start its driver.
    pub fn spawn(self: &Arc<Self>, task: &Task) {
        let cancel = CancelToken::new();
        self.cancels
            .insert(task.id.as_str().to_string(), cancel.clone());
        let supervisor = Arc::clone(self);
        let task_id = task.id.clone();
        let query = task.query.clone();
        tokio::spawn(Box::pin(async move {
            supervisor.run_task(task_id, query, cancel).await;
        }));
    }

    /// Cooperatively cancel a task. Returns false for unknown or already
    /// finished tasks.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        if let Some(cancel) = self.cancels.get(task_id.as_str()) {
            cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn trace_writer(&self) -> &TraceWriter {
        &self.trace
    }

    async fn run_task(self: Arc<Self>, task_id: TaskId, query: String, cancel: CancelToken) {
        // FIFO admission; a queued task can still be cancelled while waiting.
        let permit = tokio::select! {
            permit = self.admission.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => {
                self.finish(&task_id, TaskStatus::Cancelled, None, "cancelled while queued")
                    .await;
                return;
            }
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                self.finish(&task_id, TaskStatus::Failed, Some("scheduler shut down".into()), "admission failed")
                    .await;
                return;
            }
        };

        if self
            .store
            .update_status(&task_id, TaskStatus::InProgress)
            .await
            .is_err()
        {
            self.cancels.remove(task_id.as_str());
            return;
        }

        let ledger = CostLedger::new();
        let timeout = Duration::from_secs(self.settings.tasks.timeout_seconds);
        let outcome = tokio::select! {
            outcome = self.run_stages(&task_id, &query, &ledger, &cancel) => outcome,
            _ = tokio::time::sleep(timeout) => {
                // Stop any stragglers at their next suspension point.
                cancel.cancel();
                Err(Error::Timeout(timeout))
            }
        };

        match outcome {
            Ok(result) => {
                let _ = self.store.close_open_step(&task_id, None).await;
                let _ = self.store.set_result(&task_id, result).await;
                let _ = self
                    .store
                    .update_status(&task_id, TaskStatus::Complete)
                    .await;
                self.trace_terminal(&task_id, "complete", None);
            }
            Err(Error::Cancelled) => {
                self.finish(&task_id, TaskStatus::Cancelled, None, "cancelled")
                    .await;
            }
            Err(Error::Timeout(after)) => {
                let detail = format!("task timed out after {}s", after.as_secs());
                self.finish(&task_id, TaskStatus::Failed, Some(detail), "timeout")
                    .await;
            }
            Err(e) => {
                self.finish(&task_id, TaskStatus::Failed, Some(e.to_string()), "failed")
                    .await;
            }
        }

        self.trace.finalize(&task_id);
        self.cancels.remove(task_id.as_str());
    }

    /// Terminal bookkeeping shared by every non-complete outcome.
    async fn finish(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        detail: Option<String>,
        note: &str,
    ) {
        let _ = self
            .store
            .close_open_step(task_id, Some(note.to_string()))
            .await;
        if let Some(detail) = detail {
            let _ = self.store.set_detail(task_id, detail).await;
        }
        let _ = self.store.update_status(task_id, status).await;
        self.trace_terminal(task_id, note, None);
        self.cancels.remove(task_id.as_str());
    }

    fn trace_terminal(&self, task_id: &TaskId, note: &str, output: Option<serde_json::Value>) {
        let now = Utc::now();
        self.trace.append(
            task_id,
            TraceRecord {
                stage: "terminal".to_string(),
                started_at: now,
                ended_at: now,
                duration_ms: 0,
                summary: note.to_string(),
                output: output.unwrap_or(serde_json::Value::Null),
                cost: CostRecord::default(),
                warnings: Vec::new(),
            },
        );
    }

    async fn begin_step(&self, task_id: &TaskId, stage: &str, description: &str, size: SizeClass) {
        let _ = self.store.close_open_step(task_id, None).await;
        let now = Utc::now();
        let estimate = stage_estimate(stage, size);
        let step = Step {
            stage: stage.to_string(),
            description: description.to_string(),
            start_timestamp: now,
            estimated_timestamp: now
                + chrono::Duration::from_std(estimate).unwrap_or(chrono::Duration::zero()),
            end_timestamp: None,
            error: None,
        };
        let _ = self.store.append_step(task_id, step).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn trace_stage(
        &self,
        task_id: &TaskId,
        stage: &str,
        started: Instant,
        summary: String,
        output: serde_json::Value,
        cost: CostRecord,
        warnings: &[String],
    ) {
        let ended_at = Utc::now();
        let duration = started.elapsed();
        self.trace.append(
            task_id,
            TraceRecord {
                stage: stage.to_string(),
                started_at: ended_at
                    - chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero()),
                ended_at,
                duration_ms: duration.as_millis() as u64,
                summary,
                output,
                cost,
                warnings: warnings.to_vec(),
            },
        );
    }

    async fn run_stages(
        &self,
        task_id: &TaskId,
        query: &str,
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<TaskResult, Error> {
        let mut warnings: Vec<String> = Vec::new();
        let mut timings: BTreeMap<String, u64> = BTreeMap::new();
        let task_started = Instant::now();

        // Stage 1: decompose.
        self.begin_step(task_id, "decompose", "Understanding the question", SizeClass::Small)
            .await;
        let stage_started = Instant::now();
        let cost_before = ledger.snapshot();
        let decomposed = self.decomposer.decompose(query, ledger, cancel).await?;
        warnings.extend(decomposed.warnings.iter().cloned());
        timings.insert("decompose".into(), stage_started.elapsed().as_millis() as u64);
        self.trace_stage(
            task_id,
            "decompose",
            stage_started,
            format!("query: {query}"),
            serde_json::to_value(&decomposed.query).unwrap_or_default(),
            cost_delta(&cost_before, &ledger.snapshot()),
            &decomposed.warnings,
        );

        // Stage 2: retrieve.
        self.begin_step(task_id, "retrieve", "Searching the paper corpus", SizeClass::Medium)
            .await;
        let stage_started = Instant::now();
        let found = self.finder.find(&decomposed.query, cancel).await?;
        warnings.extend(found.warnings.iter().cloned());
        timings.insert("retrieve".into(), stage_started.elapsed().as_millis() as u64);
        self.trace_stage(
            task_id,
            "retrieve",
            stage_started,
            format!("rewritten: {}", decomposed.query.rewritten),
            serde_json::json!({
                "papers": found.papers.len(),
                "corpus_ids": found.papers.iter().map(|p| p.corpus_id.clone()).collect::<Vec<_>>(),
            }),
            CostRecord::default(),
            &found.warnings,
        );
        if found.papers.is_empty() {
            return Err(Error::from(PipelineError::NoPapers));
        }
        let papers = found.papers;
        let size = SizeClass::of(papers.len());

        // Stage 3: extract.
        self.begin_step(
            task_id,
            "extract",
            "Reading papers and extracting evidence",
            size,
        )
        .await;
        let stage_started = Instant::now();
        let cost_before = ledger.snapshot();
        let extracted = self
            .extractor
            .extract(query, &papers, ledger, cancel)
            .await
            .map_err(Error::from)?;
        warnings.extend(extracted.warnings.iter().cloned());
        timings.insert("extract".into(), stage_started.elapsed().as_millis() as u64);
        self.trace_stage(
            task_id,
            "extract",
            stage_started,
            format!("{} papers", papers.len()),
            serde_json::json!({
                "papers_with_quotes": extracted.quotes.len(),
                "quotes": extracted.quotes.iter().map(|q| q.quotes.len()).sum::<usize>(),
            }),
            cost_delta(&cost_before, &ledger.snapshot()),
            &extracted.warnings,
        );
        if extracted.quotes.is_empty() {
            return Err(Error::from(PipelineError::NoQuotes));
        }

        // Stage 4: plan.
        self.begin_step(task_id, "plan", "Planning the report outline", size)
            .await;
        let stage_started = Instant::now();
        let cost_before = ledger.snapshot();
        let planned = self
            .planner
            .plan(query, &extracted.quotes, ledger, cancel)
            .await
            .map_err(Error::from)?;
        warnings.extend(planned.warnings.iter().cloned());
        timings.insert("plan".into(), stage_started.elapsed().as_millis() as u64);
        self.trace_stage(
            task_id,
            "plan",
            stage_started,
            format!("{} quote sets", extracted.quotes.len()),
            serde_json::to_value(&planned.outline).unwrap_or_default(),
            cost_delta(&cost_before, &ledger.snapshot()),
            &planned.warnings,
        );

        // Stage 5: synthesize, with table building in parallel.
        self.begin_step(
            task_id,
            "synthesize",
            "Writing sections and building tables",
            SizeClass::of(planned.outline.sections.len()),
        )
        .await;
        let stage_started = Instant::now();
        let cost_before = ledger.snapshot();

        let synth_fut = self.synthesizer.synthesize(
            query,
            &planned.outline,
            &extracted.quotes,
            &papers,
            ledger,
            cancel,
        );
        let tables_fut = self.build_tables(query, &planned, &papers, &extracted.quotes, ledger, cancel);
        let (synth, tables) = tokio::join!(synth_fut, tables_fut);

        let synth = synth.map_err(Error::from)?;
        let mut stage_warnings = synth.warnings.clone();
        let mut sections = synth.sections;

        // Tables are best-effort; merge whatever finished.
        match tables {
            Ok((built, table_warnings)) => {
                stage_warnings.extend(table_warnings);
                merge_tables(&mut sections, built);
            }
            Err(e) if e.is_cancellation() => return Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "table building failed entirely");
                stage_warnings.push(format!("tables unavailable: {e}"));
            }
        }
        warnings.extend(stage_warnings.iter().cloned());

        timings.insert(
            "synthesize".into(),
            stage_started.elapsed().as_millis() as u64,
        );
        self.trace_stage(
            task_id,
            "synthesize",
            stage_started,
            format!("{} sections", sections.len()),
            serde_json::json!({
                "sections": sections.iter().map(|s| s.title.clone()).collect::<Vec<_>>(),
                "tables": sections.iter().filter(|s| s.table.is_some()).count(),
            }),
            cost_delta(&cost_before, &ledger.snapshot()),
            &stage_warnings,
        );

        // Referenced papers are the quote-bearing ones, in reference order.
        let referenced: Vec<_> = extracted
            .quotes
            .iter()
            .filter_map(|set| {
                papers
                    .iter()
                    .find(|p| p.reference == set.reference)
                    .map(|p| p.record.clone())
            })
            .collect();

        Ok(TaskResult {
            sections,
            papers: referenced,
            cost: ledger.snapshot(),
            timing: TimingRecord {
                total_ms: task_started.elapsed().as_millis() as u64,
                by_stage: timings,
            },
            warnings,
        })
    }

    /// Build tables for every eligible list section.
    async fn build_tables(
        &self,
        query: &str,
        planned: &scholarqa_pipeline::PlanOutcome,
        papers: &[PaperAggregate],
        quotes: &[QuoteSet],
        ledger: &CostLedger,
        cancel: &CancelToken,
    ) -> Result<(Vec<(String, scholarqa_core::Table)>, Vec<String>), scholarqa_pipeline::PipelineError>
    {
        let mut built = Vec::new();
        let mut warnings = Vec::new();
        for plan in &planned.outline.sections {
            if !self.tables.should_build(plan) {
                continue;
            }
            let (table, table_warnings) = self
                .tables
                .build(query, plan, papers, quotes, ledger, cancel)
                .await?;
            warnings.extend(table_warnings);
            if let Some(table) = table {
                built.push((plan.name.clone(), table));
            }
        }
        Ok((built, warnings))
    }

    /// Humanized total estimate for a freshly submitted task.
    pub fn initial_estimate(&self) -> String {
        humanize(total_estimate(SizeClass::Medium))
    }
}

fn merge_tables(
    sections: &mut [GeneratedSection],
    built: Vec<(String, scholarqa_core::Table)>,
) {
    for (name, table) in built {
        if let Some(section) = sections.iter_mut().find(|s| s.title == name) {
            section.table = Some(table);
        }
    }
}

/// Per-model usage incurred between two ledger snapshots.
fn cost_delta(before: &CostRecord, after: &CostRecord) -> CostRecord {
    let mut delta = CostRecord::default();
    for (model, usage) in &after.by_model {
        let prior = before.by_model.get(model).cloned().unwrap_or_default();
        let diff = ModelUsage {
            calls: usage.calls.saturating_sub(prior.calls),
            cached_calls: usage.cached_calls.saturating_sub(prior.cached_calls),
            fallback_calls: usage.fallback_calls.saturating_sub(prior.fallback_calls),
            input_tokens: usage.input_tokens.saturating_sub(prior.input_tokens),
            output_tokens: usage.output_tokens.saturating_sub(prior.output_tokens),
            waited_ms: usage.waited_ms.saturating_sub(prior.waited_ms),
            cost_usd: (usage.cost_usd - prior.cost_usd).max(0.0),
        };
        if diff.calls > 0 || diff.input_tokens > 0 || diff.output_tokens > 0 {
            delta.by_model.insert(model.clone(), diff);
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_delta_subtracts_per_model() {
        let mut before = CostRecord::default();
        before.record(
            "m1",
            &ModelUsage {
                calls: 2,
                input_tokens: 100,
                output_tokens: 10,
                cost_usd: 0.01,
                ..Default::default()
            },
        );
        let mut after = before.clone();
        after.record(
            "m1",
            &ModelUsage {
                calls: 1,
                cached_calls: 1,
                input_tokens: 50,
                output_tokens: 5,
                cost_usd: 0.005,
                ..Default::default()
            },
        );
        after.record(
            "m2",
            &ModelUsage {
                calls: 1,
                input_tokens: 10,
                output_tokens: 1,
                cost_usd: 0.001,
                ..Default::default()
            },
        );

        let delta = cost_delta(&before, &after);
        assert_eq!(delta.by_model["m1"].calls, 1);
        assert_eq!(delta.by_model["m1"].input_tokens, 50);
        assert_eq!(delta.by_model["m2"].calls, 1);
    }

    #[test]
    fn test_merge_tables_by_title() {
        let mut sections = vec![GeneratedSection {
            title: "Comparison".into(),
            format: scholarqa_core::SectionFormat::List,
            tldr: None,
            text: "text".into(),
            citations: vec![],
            table: None,
        }];
        merge_tables(
            &mut sections,
            vec![("Comparison".into(), scholarqa_core::Table::default())],
        );
        assert!(sections[0].table.is_some());
    }
}
