//! Wiring: construct the full service from settings.
//!
//! Builds the process-wide singletons once and injects them; nothing in the
//! pipeline reaches for global state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scholarqa_config::{Settings, TraceMode};
use scholarqa_core::{Error, Result};
use scholarqa_llm::{
    CompletionCache, ModelClient, OpenAiCompatBackend, RateLimitConfig, RateLimiter,
};
use scholarqa_retrieval::{
    build_reranker, AllowAll, HttpModerator, HttpPaperIndex, MetadataCache, Moderator, PaperFinder,
};

use crate::service::TaskService;
use crate::store::{InMemoryResultStore, ResultStore};
use crate::supervisor::TaskSupervisor;
use crate::trace::{LocalTraceSink, ObjectStoreTraceSink, TraceWriter};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build a ready-to-use service with real adapters from settings.
pub fn build_service(settings: Settings) -> Result<TaskService> {
    settings
        .validate()
        .map_err(|e| Error::Config(e.to_string()))?;

    let backend = OpenAiCompatBackend::new(
        settings.provider.endpoint.clone(),
        settings.provider.api_key.clone(),
        Duration::from_millis(settings.provider.timeout_ms),
    )
    .map_err(Error::from)?;

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_minute: settings.pipeline.rate_limit_rpm,
        input_tokens_per_minute: settings.pipeline.rate_limit_itpm,
        output_tokens_per_minute: settings.pipeline.rate_limit_otpm,
        max_wait: Duration::from_millis(settings.pipeline.rate_limit_wait_ms),
    }));

    let cache = if settings.cache.enabled {
        Some(Arc::new(CompletionCache::new(
            settings.cache.max_entries,
            settings.cache.llm_cache_dir.as_deref().map(Path::new),
        )))
    } else {
        None
    };

    let client = Arc::new(ModelClient::new(Arc::new(backend), limiter, cache));

    let index = Arc::new(HttpPaperIndex::new(&settings.paper_index).map_err(Error::from)?);
    let reranker = build_reranker(&settings.rerank).map_err(Error::from)?;
    let metadata_cache = Arc::new(MetadataCache::new(Duration::from_secs(
        settings.paper_index.metadata_ttl_seconds,
    )));
    let finder = Arc::new(PaperFinder::new(
        index,
        reranker,
        metadata_cache,
        settings.retrieval.clone(),
        settings.paper_finder.clone(),
    ));

    let store = InMemoryResultStore::new(Duration::from_secs(settings.tasks.result_ttl_seconds));
    store.spawn_sweeper(SWEEP_INTERVAL);
    let store: Arc<dyn ResultStore> = store;

    let trace = match settings.trace.mode {
        TraceMode::Local => TraceWriter::spawn(LocalTraceSink::new(&settings.trace.location)),
        TraceMode::ObjectStore => TraceWriter::spawn(
            ObjectStoreTraceSink::new(settings.trace.location.clone())
                .map_err(|e| Error::Config(e.to_string()))?,
        ),
    };

    let moderator: Arc<dyn Moderator> = if settings.pipeline.validate {
        let endpoint = settings
            .pipeline
            .moderation_endpoint
            .clone()
            .ok_or_else(|| Error::Config("moderation endpoint missing".into()))?;
        Arc::new(
            HttpModerator::new(endpoint, Duration::from_secs(10)).map_err(Error::from)?,
        )
    } else {
        Arc::new(AllowAll)
    };
    let moderation_enabled = settings.pipeline.validate;

    let supervisor = TaskSupervisor::new(
        settings,
        client,
        finder,
        Arc::clone(&store),
        trace,
    );

    Ok(TaskService::new(
        supervisor,
        store,
        moderator,
        moderation_enabled,
    ))
}
