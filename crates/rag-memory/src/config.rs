//! Engine configuration, read from `RAG_*` environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache_management::EmbeddingCacheConfig;
use crate::context_engine::{OrchestratorConfig, RetrieverConfig, SummarizationConfig};
use crate::knowledge::ChunkConfig;
use crate::memory_db::RetrievalSource;
use crate::providers::{CircuitBreakerConfig, RetryPolicy};
use crate::vector_index::VectorBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerKind {
    /// Completion provider, falling back to extraction on failure
    #[default]
    Completion,
    Extractive,
}

impl FromStr for SummarizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "completion" | "llm" => Ok(Self::Completion),
            "extractive" => Ok(Self::Extractive),
            other => Err(anyhow::anyhow!("unknown summarizer {other:?}")),
        }
    }
}

/// External model endpoints. Without an embedding URL the deterministic
/// hashing embedder is used; without a completion URL answers cannot be
/// generated and summaries are extractive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub embedding_url: Option<String>,
    pub embedding_model: String,
    /// Vector width of the hashing embedder
    pub embedding_dimensions: usize,
    pub completion_url: Option<String>,
    pub completion_model: String,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_open_seconds: u64,
    pub summarizer: SummarizerKind,
    pub summarizer_timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            embedding_url: None,
            embedding_model: "hash-384".to_string(),
            embedding_dimensions: 384,
            completion_url: None,
            completion_model: "local-llm".to_string(),
            api_key: None,
            request_timeout_seconds: 30,
            max_retries: 2,
            retry_base_delay_ms: 100,
            circuit_failure_threshold: 5,
            circuit_open_seconds: 30,
            summarizer: SummarizerKind::Completion,
            summarizer_timeout_seconds: 20,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            open_duration: Duration::from_secs(self.circuit_open_seconds),
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_model.trim().is_empty() {
            anyhow::bail!("embedding model id must not be empty");
        }
        if self.embedding_url.is_none() && self.embedding_dimensions == 0 {
            anyhow::bail!("embedding_dimensions must be greater than zero");
        }
        if self.request_timeout_seconds == 0 {
            anyhow::bail!("request timeout must be greater than zero");
        }
        if self.circuit_failure_threshold == 0 {
            anyhow::bail!("circuit failure threshold must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file; in-memory database when unset
    pub database_path: Option<PathBuf>,
    pub vector_backend: VectorBackend,
    pub vector_timeout_ms: u64,
    pub providers: ProviderConfig,
    pub cache: EmbeddingCacheConfig,
    pub chunking: ChunkConfig,
    pub summarization: SummarizationConfig,
    pub retriever: RetrieverConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            vector_backend: VectorBackend::Memory,
            vector_timeout_ms: 2000,
            providers: ProviderConfig::default(),
            cache: EmbeddingCacheConfig::default(),
            chunking: ChunkConfig::default(),
            summarization: SummarizationConfig::default(),
            retriever: RetrieverConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Parse `key` if present, otherwise keep `default`
fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e)),
        _ => Ok(default),
    }
}

fn optional_var<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_sources(raw: &str) -> Result<Vec<RetrievalSource>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<RetrievalSource>())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let lookup = &lookup;

        let providers = ProviderConfig {
            embedding_url: optional_var(lookup, "RAG_EMBEDDING_URL"),
            embedding_model: optional_var(lookup, "RAG_EMBEDDING_MODEL").unwrap_or(d.providers.embedding_model),
            embedding_dimensions: parse_var(lookup, "RAG_EMBEDDING_DIMENSIONS", d.providers.embedding_dimensions)?,
            completion_url: optional_var(lookup, "RAG_COMPLETION_URL"),
            completion_model: optional_var(lookup, "RAG_COMPLETION_MODEL").unwrap_or(d.providers.completion_model),
            api_key: optional_var(lookup, "RAG_API_KEY"),
            request_timeout_seconds: parse_var(lookup, "RAG_REQUEST_TIMEOUT_SECONDS", d.providers.request_timeout_seconds)?,
            max_retries: parse_var(lookup, "RAG_MAX_RETRIES", d.providers.max_retries)?,
            retry_base_delay_ms: parse_var(lookup, "RAG_RETRY_BASE_DELAY_MS", d.providers.retry_base_delay_ms)?,
            circuit_failure_threshold: parse_var(
                lookup,
                "RAG_CIRCUIT_FAILURE_THRESHOLD",
                d.providers.circuit_failure_threshold,
            )?,
            circuit_open_seconds: parse_var(lookup, "RAG_CIRCUIT_OPEN_SECONDS", d.providers.circuit_open_seconds)?,
            summarizer: parse_var(lookup, "RAG_SUMMARIZER", d.providers.summarizer)?,
            summarizer_timeout_seconds: parse_var(
                lookup,
                "RAG_SUMMARIZER_TIMEOUT_SECONDS",
                d.providers.summarizer_timeout_seconds,
            )?,
        };

        let cache = EmbeddingCacheConfig {
            max_entries: parse_var(lookup, "RAG_CACHE_MAX_ENTRIES", d.cache.max_entries)?,
            ttl_seconds: parse_var(lookup, "RAG_CACHE_TTL_SECONDS", d.cache.ttl_seconds)?,
        };

        let chunking = ChunkConfig {
            strategy: parse_var(lookup, "RAG_CHUNK_STRATEGY", d.chunking.strategy)?,
            chunk_size: parse_var(lookup, "RAG_CHUNK_SIZE", d.chunking.chunk_size)?,
            overlap: parse_var(lookup, "RAG_CHUNK_OVERLAP", d.chunking.overlap)?,
        };

        let summarization = SummarizationConfig {
            threshold: parse_var(lookup, "RAG_SUMMARY_THRESHOLD", d.summarization.threshold)?,
            max_short_term: parse_var(lookup, "RAG_MAX_SHORT_TERM", d.summarization.max_short_term)?,
            max_medium_term: parse_var(lookup, "RAG_MAX_MEDIUM_TERM", d.summarization.max_medium_term)?,
            promotion_batch: parse_var(lookup, "RAG_PROMOTION_BATCH", d.summarization.promotion_batch)?,
            recent_message_count: parse_var(
                lookup,
                "RAG_RECENT_MESSAGE_COUNT",
                d.summarization.recent_message_count,
            )?,
            default_priority: parse_var(lookup, "RAG_DEFAULT_PRIORITY", d.summarization.default_priority)?,
        };

        let source_priority = match optional_var(lookup, "RAG_SOURCE_PRIORITY") {
            Some(raw) => parse_sources(&raw).context("invalid RAG_SOURCE_PRIORITY")?,
            None => d.retriever.source_priority,
        };
        let retriever = RetrieverConfig {
            default_top_k: parse_var(lookup, "RAG_TOP_K", d.retriever.default_top_k)?,
            max_top_k: parse_var(lookup, "RAG_MAX_TOP_K", d.retriever.max_top_k)?,
            context_budget_chars: parse_var(lookup, "RAG_CONTEXT_BUDGET_CHARS", d.retriever.context_budget_chars)?,
            source_priority,
            overfetch_factor: parse_var(lookup, "RAG_OVERFETCH_FACTOR", d.retriever.overfetch_factor)?,
            query_timeout: Duration::from_millis(parse_var(
                lookup,
                "RAG_QUERY_TIMEOUT_MS",
                d.retriever.query_timeout.as_millis() as u64,
            )?),
            max_query_chars: parse_var(lookup, "RAG_MAX_QUERY_CHARS", d.retriever.max_query_chars)?,
        };

        let mut orchestrator = d.orchestrator;
        orchestrator.completion.model = providers.completion_model.clone();
        orchestrator.completion.max_tokens =
            parse_var(lookup, "RAG_COMPLETION_MAX_TOKENS", orchestrator.completion.max_tokens)?;
        orchestrator.completion.temperature =
            parse_var(lookup, "RAG_COMPLETION_TEMPERATURE", orchestrator.completion.temperature)?;
        orchestrator.history_budget_chars =
            parse_var(lookup, "RAG_HISTORY_BUDGET_CHARS", orchestrator.history_budget_chars)?;
        orchestrator.default_deadline = Duration::from_millis(parse_var(
            lookup,
            "RAG_DEADLINE_MS",
            orchestrator.default_deadline.as_millis() as u64,
        )?);

        let config = Self {
            database_path: optional_var(lookup, "RAG_DATABASE_PATH").map(PathBuf::from),
            vector_backend: parse_var(lookup, "RAG_VECTOR_BACKEND", d.vector_backend)?,
            vector_timeout_ms: parse_var(lookup, "RAG_VECTOR_TIMEOUT_MS", d.vector_timeout_ms)?,
            providers,
            cache,
            chunking,
            summarization,
            retriever,
            orchestrator,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vector_timeout_ms == 0 {
            anyhow::bail!("vector timeout must be greater than zero");
        }
        if self.vector_backend == VectorBackend::Sqlite && self.database_path.is_none() {
            warn!("SQLite vector backend without RAG_DATABASE_PATH; vectors will not outlive the process");
        }
        self.providers.validate().context("provider configuration")?;
        self.cache.validate().context("embedding cache configuration")?;
        self.chunking.validate().context("chunking configuration")?;
        self.summarization.validate().context("summarization configuration")?;
        self.retriever.validate().context("retriever configuration")?;
        self.orchestrator.validate().context("orchestrator configuration")?;
        Ok(())
    }

    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.vector_timeout_ms)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        match &self.database_path {
            Some(path) => info!("- Database: {}", path.display()),
            None => info!("- Database: in-memory"),
        }
        info!("- Vector Backend: {:?}", self.vector_backend);
        info!(
            "- Embedding: {} ({})",
            self.providers.embedding_model,
            self.providers.embedding_url.as_deref().unwrap_or("hashing embedder")
        );
        info!(
            "- Completion: {} ({})",
            self.providers.completion_model,
            self.providers.completion_url.as_deref().unwrap_or("not configured")
        );
        info!("- Summarizer: {:?}", self.providers.summarizer);
        info!(
            "- Cache: {} entries, TTL {}s",
            self.cache.max_entries, self.cache.ttl_seconds
        );
        info!(
            "- Chunking: {:?}, size {}, overlap {}",
            self.chunking.strategy, self.chunking.chunk_size, self.chunking.overlap
        );
        info!(
            "- Summaries: threshold {}, short-term max {}, medium-term max {}, batch {}",
            self.summarization.threshold,
            self.summarization.max_short_term,
            self.summarization.max_medium_term,
            self.summarization.promotion_batch
        );
        info!(
            "- Retrieval: top_k {}, budget {} chars, priority {:?}",
            self.retriever.default_top_k, self.retriever.context_budget_chars, self.retriever.source_priority
        );
        info!("- Deadline: {}ms", self.orchestrator.default_deadline.as_millis());
    }
}
