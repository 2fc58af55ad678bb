//! End-to-end supervisor tests over mocked external services.
//!
//! The model backend is scripted by prompt inspection, the paper index and
//! reranker are in-memory fakes, so every scenario exercises the real
//! supervisor, stores, stages and rate limiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scholarqa_config::Settings;
use scholarqa_core::{
    CancelToken, CandidatePassage, CorpusId, PaperRecord, RetrievalFilters, SnippetKind,
    TaskStateDoc, TaskStatus,
};
use scholarqa_llm::{
    BackendRequest, BackendResponse, CompletionBackend, CompletionCache, LlmError, ModelClient,
    RateLimitConfig, RateLimiter, TokenUsage,
};
use scholarqa_retrieval::{
    MetadataCache, ModerationVerdict, Moderator, PaperFinder, PaperIndex, Reranker,
    RetrievalError,
};
use scholarqa_tasks::{
    InMemoryResultStore, LocalTraceSink, SubmitRequest, TaskService, TaskSupervisor, TraceWriter,
};

const P1_TEXT: &str = "Planet Nine is a hypothesized giant planet in the outer Solar System.";
const P1_NOISE: &str = "Unrelated commentary about telescope funding.";
const P2_TEXT: &str = "Clustering of Kuiper belt object orbits supports a ninth planet.";
const P3_TEXT: &str = "A cross-encoder reranker outperforms lexical baselines on passage ranking.";

/// Scripted model backend: routes on the system prompt, counts calls.
struct ScriptedBackend {
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedBackend {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let text = if request.system.contains("retrieval parameters") {
            r#"{"rewritten_query": "evidence for a ninth planet", "keyword_query": "planet nine", "filters": {}}"#
                .to_string()
        } else if request.system.contains("extract supporting evidence") {
            if request.user.contains("Paper [1]") {
                format!(r#"{{"quotes": ["{P1_TEXT}"]}}"#)
            } else if request.user.contains("Paper [2]") {
                format!(r#"{{"quotes": ["{P2_TEXT}"]}}"#)
            } else {
                format!(r#"{{"quotes": ["{P3_TEXT}"]}}"#)
            }
        } else if request.system.contains("report outline") {
            if request.user.contains("[3.0]") {
                // Three quote-bearing papers: plan a list section.
                r#"{"sections": [{"name": "Model comparison", "format": "list", "quote_ids": ["1.0", "2.0", "3.0"]}]}"#
                    .to_string()
            } else {
                r#"{"sections": [{"name": "Summary", "format": "synthesis", "quote_ids": ["1.0", "2.0"]}]}"#
                    .to_string()
            }
        } else if request.system.contains("one section of a scientific report") {
            "TLDR: Evidence favors a ninth planet\nOrbital evidence [1] and clustering [2] support it, though [7] is debated.".to_string()
        } else if request.system.contains("design a comparison table") {
            r#"{"columns": [{"name": "Method", "description": "observation method"}]}"#.to_string()
        } else if request.system.contains("one cell of a comparison table") {
            r#"{"value": "orbital dynamics"}"#.to_string()
        } else if request.system.contains("normalize one column") {
            // Echo three harmonized values for the three-row table.
            r#"{"values": ["orbital dynamics", "orbital dynamics", "orbital dynamics"]}"#
                .to_string()
        } else {
            return Err(LlmError::MalformedResponse {
                model: request.model.clone(),
                message: format!("unexpected prompt: {}", request.system),
            });
        };

        Ok(BackendResponse {
            text,
            usage: TokenUsage {
                input_tokens: 50,
                output_tokens: 25,
            },
        })
    }
}

#[derive(Clone)]
struct FakeIndex {
    passages: Vec<CandidatePassage>,
}

impl FakeIndex {
    fn two_papers() -> Self {
        Self {
            passages: vec![
                passage("p1", P1_TEXT, (0, 70), 0.95),
                passage("p1", P1_NOISE, (70, 120), 0.4),
                passage("p2", P2_TEXT, (0, 62), 0.8),
            ],
        }
    }

    fn three_papers() -> Self {
        let mut index = Self::two_papers();
        index.passages.push(passage("p3", P3_TEXT, (0, 75), 0.7));
        index
    }

    fn empty() -> Self {
        Self {
            passages: Vec::new(),
        }
    }
}

fn passage(corpus_id: &str, text: &str, offsets: (usize, usize), score: f32) -> CandidatePassage {
    CandidatePassage {
        corpus_id: corpus_id.to_string(),
        text: text.to_string(),
        section: None,
        kind: SnippetKind::Body,
        score,
        offsets: Some(offsets),
    }
}

#[async_trait]
impl PaperIndex for FakeIndex {
    async fn snippet_search(
        &self,
        _query: &str,
        _filters: &RetrievalFilters,
        _limit: usize,
        _cancel: &CancelToken,
    ) -> Result<Vec<CandidatePassage>, RetrievalError> {
        Ok(self.passages.clone())
    }

    async fn keyword_search(
        &self,
        _query: &str,
        _filters: &RetrievalFilters,
        _limit: usize,
        _cancel: &CancelToken,
    ) -> Result<Vec<PaperRecord>, RetrievalError> {
        Ok(Vec::new())
    }

    async fn fetch_metadata(
        &self,
        corpus_ids: &[CorpusId],
        _cancel: &CancelToken,
    ) -> Result<HashMap<CorpusId, PaperRecord>, RetrievalError> {
        Ok(corpus_ids
            .iter()
            .map(|id| {
                let mut record = PaperRecord::unknown(id);
                record.title = format!("Study {id}");
                record.year = Some(2020);
                record.abstract_text = Some(format!("Abstract of {id}."));
                (id.clone(), record)
            })
            .collect())
    }
}

/// Scores by passage content; optionally hard-down.
struct FakeReranker {
    healthy: bool,
}

#[async_trait]
impl Reranker for FakeReranker {
    async fn score(
        &self,
        _query: &str,
        passages: &[String],
        _cancel: &CancelToken,
    ) -> Result<Vec<f32>, RetrievalError> {
        if !self.healthy {
            return Err(RetrievalError::Upstream {
                status: 503,
                message: "reranker down".into(),
            });
        }
        Ok(passages
            .iter()
            .map(|p| {
                if p.contains("hypothesized giant planet") {
                    0.9
                } else if p.contains("Kuiper belt") {
                    0.8
                } else if p.contains("cross-encoder") {
                    0.7
                } else {
                    0.1
                }
            })
            .collect())
    }
}

struct BlockingModerator;

#[async_trait]
impl Moderator for BlockingModerator {
    async fn classify(
        &self,
        _text: &str,
        _cancel: &CancelToken,
    ) -> Result<ModerationVerdict, RetrievalError> {
        Ok(ModerationVerdict::Block {
            reason: "test policy".into(),
        })
    }
}

struct Harness {
    service: TaskService,
    backend: Arc<ScriptedBackend>,
    _trace_dir: tempfile::TempDir,
}

fn harness(settings: Settings, index: FakeIndex, reranker_healthy: bool) -> Harness {
    harness_with(settings, index, reranker_healthy, Duration::ZERO, false)
}

fn harness_with(
    mut settings: Settings,
    index: FakeIndex,
    reranker_healthy: bool,
    model_delay: Duration,
    moderation_block: bool,
) -> Harness {
    settings.pipeline.llm = "test-model".to_string();

    let backend = ScriptedBackend::new(model_delay);
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_minute: 100_000,
        input_tokens_per_minute: 100_000_000,
        output_tokens_per_minute: 100_000_000,
        max_wait: Duration::from_secs(1),
    }));
    let cache = settings
        .cache
        .enabled
        .then(|| Arc::new(CompletionCache::new(settings.cache.max_entries, None)));
    let client = Arc::new(ModelClient::new(backend.clone(), limiter, cache));

    let finder = Arc::new(PaperFinder::new(
        Arc::new(index),
        Arc::new(FakeReranker {
            healthy: reranker_healthy,
        }),
        Arc::new(MetadataCache::new(Duration::from_secs(60))),
        settings.retrieval.clone(),
        settings.paper_finder.clone(),
    ));

    let store = InMemoryResultStore::new(Duration::from_secs(3600));
    let trace_dir = tempfile::tempdir().unwrap();
    let trace = TraceWriter::spawn(LocalTraceSink::new(trace_dir.path()));

    let supervisor = TaskSupervisor::new(
        settings,
        client,
        finder,
        store.clone(),
        trace,
    );

    let moderator: Arc<dyn Moderator> = if moderation_block {
        Arc::new(BlockingModerator)
    } else {
        Arc::new(scholarqa_retrieval::AllowAll)
    };
    let service = TaskService::new(supervisor, store, moderator, moderation_block);

    Harness {
        service,
        backend,
        _trace_dir: trace_dir,
    }
}

fn submit_request(query: &str) -> SubmitRequest {
    SubmitRequest {
        query: query.to_string(),
        user_id: "tester".to_string(),
        opt_in: true,
        feedback_toggle: false,
    }
}

async fn wait_terminal(service: &TaskService, task_id: &str) -> TaskStateDoc {
    for _ in 0..200 {
        let doc = service.poll(task_id).await.unwrap();
        if doc.task_status.is_terminal() {
            return doc;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {task_id} did not reach a terminal state");
}

fn default_settings() -> Settings {
    let mut settings = Settings::default();
    settings.cache.enabled = false;
    settings.tasks.timeout_seconds = 30;
    settings
}

#[tokio::test]
async fn test_happy_path_synthesis_only() {
    let h = harness(default_settings(), FakeIndex::two_papers(), true);
    let doc = h.service.submit(submit_request("What is the ninth planet of our solar system?"))
        .await
        .unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;

    assert_eq!(doc.task_status, TaskStatus::Complete);
    let result = doc.task_result.expect("complete task must carry a result");
    assert_eq!(result.sections.len(), 1);

    let section = &result.sections[0];
    assert_eq!(section.title, "Summary");
    assert_eq!(section.tldr.as_deref(), Some("Evidence favors a ninth planet"));
    // Both papers cited, the bogus [7] marker stripped.
    assert!(section.text.contains("[1]"));
    assert!(section.text.contains("[2]"));
    assert!(!section.text.contains("[7]"));
    assert_eq!(section.citations.len(), 2);
    assert!(section.table.is_none());

    // Dense reference numbers over the two kept papers.
    assert_eq!(result.papers.len(), 2);
    assert!(result.warnings.iter().any(|w| w.contains("[7]") || w.contains('7')));

    // Steps are all closed and strictly ordered by start time.
    assert!(doc.steps.iter().all(|s| s.end_timestamp.is_some()));
    for pair in doc.steps.windows(2) {
        assert!(pair[0].start_timestamp <= pair[1].start_timestamp);
    }
    assert!(!doc.steps.is_empty());
    assert!(result.cost.total_usd() >= 0.0);
    assert!(result.cost.by_model.contains_key("test-model"));
}

#[tokio::test]
async fn test_list_section_builds_complete_table() {
    let h = harness(default_settings(), FakeIndex::three_papers(), true);
    let doc = h.service.submit(submit_request("Compare reranker models")).await.unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;

    assert_eq!(doc.task_status, TaskStatus::Complete);
    let result = doc.task_result.unwrap();
    assert_eq!(result.sections.len(), 1);

    let section = &result.sections[0];
    assert_eq!(section.title, "Model comparison");
    let table = section.table.as_ref().expect("list section gets a table");
    assert_eq!(table.columns.len(), 1);
    assert_eq!(table.rows.len(), 3);
    assert!(table.is_complete());
    for row in &table.rows {
        let cell = table.get(&row.id, &table.columns[0].id).unwrap();
        assert_eq!(cell.value, "orbital dynamics");
    }
}

#[tokio::test]
async fn test_no_retrieval_hits_fails_before_downstream_stages() {
    let h = harness(default_settings(), FakeIndex::empty(), true);
    let doc = h.service.submit(submit_request("anything")).await.unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;

    assert_eq!(doc.task_status, TaskStatus::Failed);
    assert!(doc.detail.unwrap().contains("no relevant papers"));
    assert!(doc.task_result.is_none());
    // Only the decompose call reached the model.
    assert_eq!(h.backend.call_count(), 1);
}

#[tokio::test]
async fn test_reranker_outage_completes_with_warning() {
    let h = harness(default_settings(), FakeIndex::two_papers(), false);
    let doc = h.service.submit(submit_request("ninth planet?")).await.unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;

    assert_eq!(doc.task_status, TaskStatus::Complete);
    let result = doc.task_result.unwrap();
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("reranker unavailable")));
    // Retrieval-order fallback: highest retrieval score (p1) is reference 1.
    assert_eq!(result.papers.len(), 2);
    assert!(result.papers[0].corpus_id == "p1");
}

#[tokio::test]
async fn test_cancellation_mid_flight() {
    let h = harness_with(
        default_settings(),
        FakeIndex::two_papers(),
        true,
        Duration::from_millis(200),
        false,
    );
    let doc = h.service.submit(submit_request("slow question")).await.unwrap();

    // Let the task get into the pipeline, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.service.cancel(&doc.task_id).await.unwrap();

    let doc = wait_terminal(&h.service, &doc.task_id).await;
    assert_eq!(doc.task_status, TaskStatus::Cancelled);
    assert!(doc.task_result.is_none());
    assert!(doc.steps.iter().all(|s| s.end_timestamp.is_some()));
}

#[tokio::test]
async fn test_timeout_fails_with_detail() {
    let mut settings = default_settings();
    settings.tasks.timeout_seconds = 0;
    let h = harness_with(
        settings,
        FakeIndex::two_papers(),
        true,
        Duration::from_millis(100),
        false,
    );
    let doc = h.service.submit(submit_request("never finishes")).await.unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;

    assert_eq!(doc.task_status, TaskStatus::Failed);
    assert!(doc.detail.unwrap().contains("timed out"));
    assert!(doc.steps.iter().all(|s| s.end_timestamp.is_some()));
}

#[tokio::test]
async fn test_moderation_block_makes_no_external_calls() {
    let h = harness_with(
        default_settings(),
        FakeIndex::two_papers(),
        true,
        Duration::ZERO,
        true,
    );
    let doc = h.service.submit(submit_request("blocked query")).await.unwrap();

    assert_eq!(doc.task_status, TaskStatus::Failed);
    assert!(doc.detail.unwrap().contains("not accepted"));
    assert_eq!(h.backend.call_count(), 0);
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let h = harness(default_settings(), FakeIndex::two_papers(), true);
    let doc = h.service.submit(submit_request("   ")).await.unwrap();
    assert_eq!(doc.task_status, TaskStatus::Failed);
    assert!(doc.detail.unwrap().contains("empty"));
    assert_eq!(h.backend.call_count(), 0);
}

#[tokio::test]
async fn test_warm_cache_avoids_upstream_calls() {
    let mut settings = default_settings();
    settings.cache.enabled = true;
    let h = harness(settings, FakeIndex::two_papers(), true);

    let doc = h.service.submit(submit_request("cached question")).await.unwrap();
    wait_terminal(&h.service, &doc.task_id).await;
    let first_run_calls = h.backend.call_count();
    assert!(first_run_calls > 0);

    let doc = h.service.submit(submit_request("cached question")).await.unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;
    assert_eq!(doc.task_status, TaskStatus::Complete);
    // Second run is served from the completion cache.
    assert_eq!(h.backend.call_count(), first_run_calls);

    // Cached calls still account their costs.
    let result = doc.task_result.unwrap();
    let usage = &result.cost.by_model["test-model"];
    assert_eq!(usage.cached_calls, usage.calls);
}

#[tokio::test]
async fn test_admission_cap_keeps_excess_tasks_queued() {
    let mut settings = default_settings();
    settings.tasks.max_concurrent = 1;
    let h = harness_with(
        settings,
        FakeIndex::two_papers(),
        true,
        Duration::from_millis(150),
        false,
    );

    let first = h.service.submit(submit_request("first")).await.unwrap();
    let second = h.service.submit(submit_request("second")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let first_now = h.service.poll(&first.task_id).await.unwrap();
    let second_now = h.service.poll(&second.task_id).await.unwrap();
    assert_eq!(first_now.task_status, TaskStatus::InProgress);
    assert_eq!(second_now.task_status, TaskStatus::Queued);

    assert_eq!(
        wait_terminal(&h.service, &first.task_id).await.task_status,
        TaskStatus::Complete
    );
    assert_eq!(
        wait_terminal(&h.service, &second.task_id).await.task_status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn test_feedback_round_trip() {
    let h = harness(default_settings(), FakeIndex::two_papers(), true);
    let doc = h.service.submit(submit_request("q")).await.unwrap();

    let ack = h
        .service
        .feedback(scholarqa_tasks::FeedbackRequest {
            task_id: doc.task_id.clone(),
            user_id: "tester".into(),
            text: Some("great report".into()),
            reaction: Some(scholarqa_tasks::Reaction::ThumbsUp),
            section: None,
        })
        .await
        .unwrap();
    assert!(!ack.is_empty());

    // Feedback with neither text nor reaction is rejected.
    let err = h
        .service
        .feedback(scholarqa_tasks::FeedbackRequest {
            task_id: doc.task_id.clone(),
            user_id: "tester".into(),
            text: None,
            reaction: None,
            section: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("feedback"));
}

#[tokio::test]
async fn test_state_doc_serialization_round_trip() {
    let h = harness(default_settings(), FakeIndex::two_papers(), true);
    let doc = h.service.submit(submit_request("ninth planet?")).await.unwrap();
    let doc = wait_terminal(&h.service, &doc.task_id).await;

    let json = serde_json::to_string(&doc).unwrap();
    let back: TaskStateDoc = serde_json::from_str(&json).unwrap();
    assert_eq!(back.task_status, doc.task_status);
    assert_eq!(back.steps.len(), doc.steps.len());
    assert_eq!(
        back.task_result.unwrap().sections.len(),
        doc.task_result.unwrap().sections.len()
    );
}
