//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rag_memory::cache_management::{EmbeddingCache, EmbeddingCacheConfig};
use rag_memory::context_engine::{
    ExtractiveSummarizer, MemoryManager, Retriever, RetrieverConfig, SummarizationConfig, Summarizer,
    SummaryInput,
};
use rag_memory::knowledge::{ChunkConfig, KnowledgeStore, NewKnowledgeItem};
use rag_memory::memory_db::{DocumentMetadata, MemoryDatabase, SummaryTier, VectorKind};
use rag_memory::providers::{EmbeddingProvider, HashingEmbeddingProvider};
use rag_memory::tracking::OperationTracker;
use rag_memory::utils::ManualClock;
use rag_memory::vector_index::{InMemoryVectorIndex, MetadataFilter, VectorIndex, VectorMatch};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MODEL: &str = "hash-256";

pub fn at(minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, second).unwrap()
}

/// Hashing embedder that counts calls and can be slowed down
pub struct CountingEmbedder {
    inner: HashingEmbeddingProvider,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl CountingEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: HashingEmbeddingProvider::new(256),
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str, model_id: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.embed(text, model_id).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// In-memory index whose failures can be switched on per operation
#[derive(Default)]
pub struct ControlledIndex {
    inner: InMemoryVectorIndex,
    pub fail_upserts: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub fail_knowledge_queries: AtomicBool,
    pub fail_memory_queries: AtomicBool,
    pub upserts: AtomicUsize,
}

impl ControlledIndex {
    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for ControlledIndex {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: DocumentMetadata) -> anyhow::Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            anyhow::bail!("vector index unreachable");
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(id, vector, metadata).await
    }

    async fn query(&self, vector: &[f32], top_k: usize, filter: &MetadataFilter) -> anyhow::Result<Vec<VectorMatch>> {
        let failing = match filter.kind {
            Some(VectorKind::KnowledgeChunk) => &self.fail_knowledge_queries,
            Some(VectorKind::Summary) => &self.fail_memory_queries,
            None => &self.fail_knowledge_queries,
        };
        if failing.load(Ordering::SeqCst) {
            anyhow::bail!("vector index unreachable");
        }
        self.inner.query(vector, top_k, filter).await
    }

    async fn delete(&self, ids: &[String]) -> anyhow::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("vector index unreachable");
        }
        self.inner.delete(ids).await
    }

    async fn len(&self) -> anyhow::Result<usize> {
        self.inner.len().await
    }

    fn backend_name(&self) -> &'static str {
        "controlled"
    }
}

/// Extractive summarizer that takes its time, so concurrent appends overlap
pub struct SlowSummarizer {
    inner: ExtractiveSummarizer,
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowSummarizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: ExtractiveSummarizer::default(),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(&self, input: SummaryInput<'_>, tier: SummaryTier) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.summarize(input, tier).await
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub db: Arc<MemoryDatabase>,
    pub embedder: Arc<CountingEmbedder>,
    pub cache: Arc<EmbeddingCache>,
    pub index: Arc<ControlledIndex>,
    pub knowledge: KnowledgeStore,
    pub memory: Arc<MemoryManager>,
    pub retriever: Retriever,
    pub tracker: OperationTracker,
}

impl Harness {
    pub fn new(summarization: SummarizationConfig) -> Self {
        Self::with_retriever(summarization, RetrieverConfig::default())
    }

    pub fn with_retriever(summarization: SummarizationConfig, retriever: RetrieverConfig) -> Self {
        Self::build(summarization, retriever, Arc::new(ExtractiveSummarizer::default()))
    }

    pub fn with_summarizer(summarization: SummarizationConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self::build(summarization, RetrieverConfig::default(), summarizer)
    }

    fn build(
        summarization: SummarizationConfig,
        retriever: RetrieverConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(at(0, 0)));
        let db = Arc::new(MemoryDatabase::new_in_memory().expect("in-memory database"));
        let embedder = Arc::new(CountingEmbedder::new(Duration::ZERO));
        let cache = Arc::new(
            EmbeddingCache::new(embedder.clone(), &EmbeddingCacheConfig::default(), clock.clone())
                .expect("embedding cache"),
        );
        let index = Arc::new(ControlledIndex::default());
        let knowledge = KnowledgeStore::new(
            db.clone(),
            cache.clone(),
            index.clone(),
            ChunkConfig::default(),
            MODEL,
            clock.clone(),
            Duration::from_secs(1),
        )
        .expect("knowledge store");
        let memory = Arc::new(
            MemoryManager::new(
                db.clone(),
                cache.clone(),
                index.clone(),
                summarizer,
                summarization,
                MODEL,
                clock.clone(),
                Duration::from_secs(1),
            )
            .expect("memory manager"),
        );
        let retriever = Retriever::new(
            db.clone(),
            cache.clone(),
            index.clone(),
            memory.clone(),
            retriever,
            MODEL,
            clock.clone(),
        )
        .expect("retriever");
        let tracker = OperationTracker::new(db.clone(), MODEL, clock.clone());
        Self {
            clock,
            db,
            embedder,
            cache,
            index,
            knowledge,
            memory,
            retriever,
            tracker,
        }
    }

    pub async fn add_knowledge(&self, id: &str, owner: &str, content: &str) {
        self.knowledge
            .create(NewKnowledgeItem {
                id: Some(id.to_string()),
                owner_id: owner.to_string(),
                title: None,
                content: content.to_string(),
            })
            .await
            .expect("knowledge item created");
    }
}
