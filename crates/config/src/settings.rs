//! Main settings record.

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub rerank: RerankConfig,

    #[serde(default)]
    pub paper_finder: PaperFinderConfig,

    #[serde(default)]
    pub paper_index: PaperIndexConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub tables: TablesConfig,

    #[serde(default)]
    pub tasks: TasksConfig,

    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Retrieval fan-in limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Passage candidates requested from snippet search.
    #[serde(default = "default_n_retrieval")]
    pub n_retrieval: usize,
    /// Paper candidates requested from keyword search.
    #[serde(default = "default_n_keyword_srch")]
    pub n_keyword_srch: usize,
}

fn default_n_retrieval() -> usize {
    256
}

fn default_n_keyword_srch() -> usize {
    20
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            n_retrieval: default_n_retrieval(),
            n_keyword_srch: default_n_keyword_srch(),
        }
    }
}

/// Which reranker backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankService {
    #[default]
    RemoteHttp,
    ModalLike,
    InProcessCrossencoder,
    InProcessBiencoder,
    InProcessFlag,
}

impl RerankService {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteHttp | Self::ModalLike)
    }
}

/// Reranker selection and transport limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub service: RerankService,
    /// Endpoint for the remote services.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_rerank_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_rerank_batch")]
    pub batch_size: usize,
    /// Maximum concurrently in-flight batches.
    #[serde(default = "default_rerank_inflight")]
    pub max_inflight: usize,
}

fn default_rerank_timeout_ms() -> u64 {
    20_000
}

fn default_rerank_batch() -> usize {
    32
}

fn default_rerank_inflight() -> usize {
    4
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            service: RerankService::default(),
            endpoint: None,
            api_key: None,
            client_timeout_ms: default_rerank_timeout_ms(),
            batch_size: default_rerank_batch(),
            max_inflight: default_rerank_inflight(),
        }
    }
}

/// Paper finder thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperFinderConfig {
    /// Papers kept after rerank aggregation.
    #[serde(default = "default_n_rerank")]
    pub n_rerank: usize,
    /// Passages below this rerank score are dropped.
    #[serde(default = "default_context_threshold")]
    pub context_threshold: f32,
    /// Kept passages per paper.
    #[serde(default = "default_passages_per_paper")]
    pub passages_per_paper: usize,
}

fn default_n_rerank() -> usize {
    12
}

fn default_context_threshold() -> f32 {
    0.3
}

fn default_passages_per_paper() -> usize {
    4
}

impl Default for PaperFinderConfig {
    fn default() -> Self {
        Self {
            n_rerank: default_n_rerank(),
            context_threshold: default_context_threshold(),
            passages_per_paper: default_passages_per_paper(),
        }
    }
}

/// Remote paper index endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperIndexConfig {
    #[serde(default = "default_index_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_index_timeout_ms")]
    pub timeout_ms: u64,
    /// TTL for the cross-task paper metadata cache.
    #[serde(default = "default_metadata_ttl")]
    pub metadata_ttl_seconds: u64,
}

fn default_index_endpoint() -> String {
    "https://api.semanticscholar.org/graph/v1".to_string()
}

fn default_index_timeout_ms() -> u64 {
    15_000
}

fn default_metadata_ttl() -> u64 {
    3600
}

impl Default for PaperIndexConfig {
    fn default() -> Self {
        Self {
            endpoint: default_index_endpoint(),
            api_key: None,
            timeout_ms: default_index_timeout_ms(),
            metadata_ttl_seconds: default_metadata_ttl(),
        }
    }
}

/// OpenAI-compatible completion endpoint serving the configured models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_provider_endpoint(),
            api_key: None,
            timeout_ms: default_provider_timeout_ms(),
        }
    }
}

/// Model selection, fan-out bounds and rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Primary model for extraction, planning and synthesis.
    #[serde(default = "default_llm")]
    pub llm: String,
    /// Ordered fallback list behind the primary.
    #[serde(default)]
    pub fallback_llm: Vec<String>,
    /// Model for query decomposition; defaults to the primary.
    #[serde(default)]
    pub decomposer_llm: Option<String>,
    /// Model for table building; defaults to the primary.
    #[serde(default)]
    pub tables_llm: Option<String>,
    /// Worker pool size for per-paper and per-cell fan-out.
    #[serde(default = "default_max_llm_workers")]
    pub max_llm_workers: usize,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u64,
    /// Input tokens per minute.
    #[serde(default = "default_rate_limit_itpm")]
    pub rate_limit_itpm: u64,
    /// Output tokens per minute.
    #[serde(default = "default_rate_limit_otpm")]
    pub rate_limit_otpm: u64,
    /// How long a call may wait on rate-limit buckets before failing over.
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,
    /// Enable the moderation gate on submitted queries.
    #[serde(default)]
    pub validate: bool,
    /// Moderation endpoint, required when `validate` is set.
    #[serde(default)]
    pub moderation_endpoint: Option<String>,
    /// Tail of previously generated sections carried into each synthesis call.
    #[serde(default = "default_context_tail_chars")]
    pub context_tail_chars: usize,
}

fn default_llm() -> String {
    "gpt-4o".to_string()
}

fn default_max_llm_workers() -> usize {
    8
}

fn default_rate_limit_rpm() -> u64 {
    300
}

fn default_rate_limit_itpm() -> u64 {
    200_000
}

fn default_rate_limit_otpm() -> u64 {
    50_000
}

fn default_rate_limit_wait_ms() -> u64 {
    30_000
}

fn default_context_tail_chars() -> usize {
    4000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm: default_llm(),
            fallback_llm: Vec::new(),
            decomposer_llm: None,
            tables_llm: None,
            max_llm_workers: default_max_llm_workers(),
            rate_limit_rpm: default_rate_limit_rpm(),
            rate_limit_itpm: default_rate_limit_itpm(),
            rate_limit_otpm: default_rate_limit_otpm(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            validate: false,
            moderation_endpoint: None,
            context_tail_chars: default_context_tail_chars(),
        }
    }
}

/// Comparison-table caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablesConfig {
    #[serde(default = "default_max_columns")]
    pub max_columns: usize,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    /// Minimum cited papers for a list section to get a table.
    #[serde(default = "default_min_papers")]
    pub min_papers: usize,
}

fn default_max_columns() -> usize {
    5
}

fn default_max_rows() -> usize {
    10
}

fn default_min_papers() -> usize {
    3
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            max_columns: default_max_columns(),
            max_rows: default_max_rows(),
            min_papers: default_min_papers(),
        }
    }
}

/// Cross-task admission and lifetime limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Simultaneously in-flight tasks; queued tasks wait FIFO.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-task wall-clock timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Terminal tasks are evicted from the result store after this long.
    #[serde(default = "default_result_ttl")]
    pub result_ttl_seconds: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_result_ttl() -> u64 {
    24 * 3600
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_seconds: default_timeout_seconds(),
            result_ttl_seconds: default_result_ttl(),
        }
    }
}

/// Where per-task trace documents go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    #[default]
    Local,
    ObjectStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default)]
    pub mode: TraceMode,
    /// Directory for local mode, base URL for object-store mode.
    #[serde(default = "default_trace_location")]
    pub location: String,
}

fn default_trace_location() -> String {
    "traces".to_string()
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            mode: TraceMode::default(),
            location: default_trace_location(),
        }
    }
}

/// Model-call cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// On-disk mirror; memory-only when unset.
    #[serde(default)]
    pub llm_cache_dir: Option<String>,
    /// In-memory LRU capacity, in entries.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_entries() -> usize {
    2048
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            llm_cache_dir: None,
            max_entries: default_cache_entries(),
        }
    }
}

impl Settings {
    /// Layer defaults, an optional TOML file and `SCHOLARQA_` env overrides.
    ///
    /// Env keys use `__` as the section separator, e.g.
    /// `SCHOLARQA_PIPELINE__MAX_LLM_WORKERS=4`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("SCHOLARQA").separator("__"));
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.max_concurrent == 0 {
            return Err(ConfigError::Invalid("tasks.max_concurrent must be >= 1".into()));
        }
        if self.pipeline.max_llm_workers == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_llm_workers must be >= 1".into(),
            ));
        }
        if self.pipeline.llm.is_empty() {
            return Err(ConfigError::Invalid("pipeline.llm must be set".into()));
        }
        if !(0.0..=1.0).contains(&self.paper_finder.context_threshold) {
            return Err(ConfigError::Invalid(
                "paper_finder.context_threshold must be in [0, 1]".into(),
            ));
        }
        if self.rerank.service.is_remote() && self.rerank.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "rerank.endpoint is required for remote rerank services".into(),
            ));
        }
        if self.rerank.batch_size == 0 || self.rerank.max_inflight == 0 {
            return Err(ConfigError::Invalid(
                "rerank.batch_size and rerank.max_inflight must be >= 1".into(),
            ));
        }
        if self.pipeline.validate && self.pipeline.moderation_endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "pipeline.moderation_endpoint is required when pipeline.validate is set".into(),
            ));
        }
        if self.tables.max_columns == 0 || self.tables.max_rows == 0 {
            return Err(ConfigError::Invalid(
                "tables.max_columns and tables.max_rows must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Model used for query decomposition.
    pub fn decomposer_model(&self) -> &str {
        self.pipeline
            .decomposer_llm
            .as_deref()
            .unwrap_or(&self.pipeline.llm)
    }

    /// Model used for table building.
    pub fn tables_model(&self) -> &str {
        self.pipeline
            .tables_llm
            .as_deref()
            .unwrap_or(&self.pipeline.llm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.paper_finder.context_threshold, 0.3);
        assert_eq!(settings.tables.min_papers, 3);
        assert_eq!(settings.decomposer_model(), settings.pipeline.llm);
    }

    #[test]
    fn test_remote_rerank_requires_endpoint() {
        let mut settings = Settings::default();
        settings.rerank.service = RerankService::RemoteHttp;
        settings.rerank.endpoint = None;
        assert!(settings.validate().is_err());

        settings.rerank.service = RerankService::InProcessBiencoder;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut settings = Settings::default();
        settings.tasks.max_concurrent = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_moderation_requires_endpoint() {
        let mut settings = Settings::default();
        settings.pipeline.validate = true;
        assert!(settings.validate().is_err());
        settings.pipeline.moderation_endpoint = Some("http://localhost:9/moderate".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
llm = "model-x"
fallback_llm = ["model-y"]
max_llm_workers = 3

[rerank]
service = "in_process_biencoder"

[tasks]
max_concurrent = 2
"#
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.pipeline.llm, "model-x");
        assert_eq!(settings.pipeline.fallback_llm, vec!["model-y"]);
        assert_eq!(settings.pipeline.max_llm_workers, 3);
        assert_eq!(settings.rerank.service, RerankService::InProcessBiencoder);
        assert_eq!(settings.tasks.max_concurrent, 2);
        // Untouched sections keep defaults.
        assert_eq!(settings.retrieval.n_keyword_srch, 20);
    }
}
