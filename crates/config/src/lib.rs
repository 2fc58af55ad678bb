//! Configuration for the scholar QA orchestrator.
//!
//! One typed `Settings` record covers the whole recognized surface:
//! retrieval, rerank, paper finder, pipeline, tasks, trace and cache
//! sections. Loading layers defaults, an optional TOML file and
//! `SCHOLARQA_`-prefixed environment overrides.

pub mod settings;

pub use settings::{
    CacheConfig, PaperFinderConfig, PaperIndexConfig, PipelineConfig, ProviderConfig, RerankConfig,
    RerankService, RetrievalConfig, Settings, TablesConfig, TasksConfig, TraceConfig, TraceMode,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}
