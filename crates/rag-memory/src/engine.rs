//! Wires every component from a `Config`

use std::sync::Arc;
use tracing::info;

use crate::cache_management::EmbeddingCache;
use crate::config::{Config, ProviderConfig, SummarizerKind};
use crate::context_engine::{
    Answer, AnswerRequest, AnswerStream, CompletionOrchestrator, CompletionSummarizer, ExtractiveSummarizer,
    MemoryManager, RankedContext, RetrievalRequest, Retriever, Summarizer,
};
use crate::error::{RagError, RagResult};
use crate::knowledge::{KnowledgeStore, ReconcileReport};
use crate::memory_db::{DatabaseStats, MemoryDatabase};
use crate::metrics;
use crate::providers::{
    CompletionOptions, CompletionProvider, EmbeddingProvider, HashingEmbeddingProvider, HttpCompletionProvider,
    HttpEmbeddingProvider, ResilientEmbeddingProvider,
};
use crate::tracking::OperationTracker;
use crate::utils::{Clock, SystemClock};
use crate::vector_index::{InMemoryVectorIndex, SqliteVectorIndex, VectorBackend, VectorIndex};

/// Embedding provider selected by configuration, wrapped with retries and a
/// circuit breaker when it goes over the network
pub fn build_embedding_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match &config.embedding_url {
        Some(url) => {
            let http = HttpEmbeddingProvider::new(url.as_str(), config.api_key.clone(), config.request_timeout())?;
            Ok(Arc::new(ResilientEmbeddingProvider::new(
                Arc::new(http),
                config.retry_policy(),
                config.breaker_config(),
                config.request_timeout(),
            )))
        }
        None => Ok(Arc::new(HashingEmbeddingProvider::new(config.embedding_dimensions))),
    }
}

pub fn build_completion_provider(config: &ProviderConfig) -> anyhow::Result<Option<Arc<dyn CompletionProvider>>> {
    match &config.completion_url {
        Some(url) => {
            let http = HttpCompletionProvider::new(url.as_str(), config.api_key.clone(), config.request_timeout())?;
            Ok(Some(Arc::new(http)))
        }
        None => Ok(None),
    }
}

pub struct RagEngine {
    config: Config,
    db: Arc<MemoryDatabase>,
    cache: Arc<EmbeddingCache>,
    index: Arc<dyn VectorIndex>,
    knowledge: Arc<KnowledgeStore>,
    memory: Arc<MemoryManager>,
    retriever: Arc<Retriever>,
    tracker: Arc<OperationTracker>,
    orchestrator: Option<CompletionOrchestrator>,
}

impl RagEngine {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = build_embedding_provider(&config.providers)?;
        let completion = build_completion_provider(&config.providers)?;
        Self::with_providers(config, embedder, completion, Arc::new(SystemClock))
    }

    /// Build around caller-supplied providers and clock
    pub fn with_providers(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Option<Arc<dyn CompletionProvider>>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        metrics::init_metrics();

        let db = Arc::new(match &config.database_path {
            Some(path) => MemoryDatabase::new(path)?,
            None => MemoryDatabase::new_in_memory()?,
        });
        let index: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::Memory => Arc::new(InMemoryVectorIndex::new()),
            VectorBackend::Sqlite => Arc::new(SqliteVectorIndex::new(db.pool())),
        };
        let cache = Arc::new(EmbeddingCache::new(embedder, &config.cache, clock.clone())?);
        let model_id = config.providers.embedding_model.clone();

        let extractive = ExtractiveSummarizer::default();
        let summarizer: Arc<dyn Summarizer> = match (config.providers.summarizer, &completion) {
            (SummarizerKind::Completion, Some(provider)) => Arc::new(CompletionSummarizer::new(
                provider.clone(),
                CompletionOptions {
                    model: config.providers.completion_model.clone(),
                    max_tokens: 256,
                    temperature: 0.2,
                },
                config.providers.summarizer_timeout(),
                extractive,
            )),
            _ => Arc::new(extractive),
        };

        let knowledge = Arc::new(KnowledgeStore::new(
            db.clone(),
            cache.clone(),
            index.clone(),
            config.chunking.clone(),
            model_id.as_str(),
            clock.clone(),
            config.vector_timeout(),
        )?);
        let memory = Arc::new(MemoryManager::new(
            db.clone(),
            cache.clone(),
            index.clone(),
            summarizer,
            config.summarization.clone(),
            model_id.as_str(),
            clock.clone(),
            config.vector_timeout(),
        )?);
        let retriever = Arc::new(Retriever::new(
            db.clone(),
            cache.clone(),
            index.clone(),
            memory.clone(),
            config.retriever.clone(),
            model_id.as_str(),
            clock.clone(),
        )?);
        let tracker = Arc::new(OperationTracker::new(db.clone(), model_id.as_str(), clock));
        let orchestrator = match completion {
            Some(provider) => Some(CompletionOrchestrator::new(
                memory.clone(),
                retriever.clone(),
                tracker.clone(),
                provider,
                config.orchestrator.clone(),
            )?),
            None => None,
        };

        info!(
            "RAG engine ready: model {}, {:?} vector index, completion {}",
            model_id,
            config.vector_backend,
            if orchestrator.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            config,
            db,
            cache,
            index,
            knowledge,
            memory,
            retriever,
            tracker,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    fn orchestrator(&self) -> RagResult<&CompletionOrchestrator> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| RagError::provider("completion", "no completion provider configured"))
    }

    /// Retrieve and record without generating an answer
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RagResult<RankedContext> {
        let context = self.retriever.retrieve(request).await?;
        self.tracker.record(&context, None);
        Ok(context)
    }

    pub async fn answer(&self, request: AnswerRequest) -> RagResult<Answer> {
        self.orchestrator()?.answer(request).await
    }

    pub async fn answer_stream(&self, request: AnswerRequest) -> RagResult<AnswerStream> {
        self.orchestrator()?.answer_stream(request).await
    }

    /// Retry deferred vector deletions, then embed summaries stored without a vector
    pub async fn run_maintenance(&self, limit: usize) -> RagResult<(ReconcileReport, usize)> {
        let report = self.knowledge.reconcile_orphans(limit).await?;
        let backfilled = self.memory.backfill_embeddings(limit).await?;
        self.db.run_maintenance()?;
        Ok((report, backfilled))
    }

    pub fn stats(&self) -> RagResult<DatabaseStats> {
        Ok(self.db.get_stats()?)
    }
}
