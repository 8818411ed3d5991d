//! Query-time retrieval over the knowledge and memory namespaces
//!
//! One query embedding is matched against the user's knowledge chunks and,
//! when a conversation is given, its active summaries. Both lookups run
//! concurrently under a per-call timeout. Losing one source degrades the
//! result; losing both fails it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::context_builder::select_prefix;
use super::memory_manager::MemoryManager;
use crate::cache_management::EmbeddingCache;
use crate::error::{RagError, RagResult};
use crate::memory_db::{summary_vector_id, DocumentMetadata, MemoryDatabase, RetrievalSource, SummaryTier};
use crate::metrics;
use crate::utils::{Clock, TextUtils};
use crate::vector_index::{timed, MetadataFilter, VectorIndex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieverConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Character budget of the assembled context
    pub context_budget_chars: usize,
    /// Tie-break order between sources, first wins
    pub source_priority: Vec<RetrievalSource>,
    /// Index candidates fetched per requested result
    pub overfetch_factor: usize,
    pub query_timeout: Duration,
    pub max_query_chars: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 50,
            context_budget_chars: 4000,
            source_priority: vec![RetrievalSource::Knowledge, RetrievalSource::Memory],
            overfetch_factor: 3,
            query_timeout: Duration::from_secs(2),
            max_query_chars: 4000,
        }
    }
}

impl RetrieverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_top_k == 0 || self.default_top_k > self.max_top_k {
            anyhow::bail!(
                "default_top_k ({}) must be between 1 and max_top_k ({})",
                self.default_top_k,
                self.max_top_k
            );
        }
        if self.overfetch_factor == 0 {
            anyhow::bail!("overfetch_factor must be at least 1");
        }
        if self.max_query_chars == 0 {
            anyhow::bail!("max_query_chars must be at least 1");
        }
        Ok(())
    }

    fn source_rank(&self, source: RetrievalSource) -> usize {
        self.source_priority
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.source_priority.len())
    }
}

/// Caller-supplied restrictions, applied inside the index query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    pub sources: Option<Vec<RetrievalSource>>,
    pub knowledge_item_ids: Option<Vec<String>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub tiers: Option<Vec<SummaryTier>>,
}

impl RetrievalFilters {
    fn allows(&self, source: RetrievalSource) -> bool {
        self.sources.as_ref().map_or(true, |s| s.contains(&source))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub top_k: Option<usize>,
    pub filters: RetrievalFilters,
    pub budget_chars: Option<usize>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    /// Vector id: `{item}#{chunk}` or `summary:{id}`
    pub document_id: String,
    pub source: RetrievalSource,
    pub score: f32,
    pub content: String,
    pub metadata: DocumentMetadata,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedSource {
    pub source: RetrievalSource,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedContext {
    pub query: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    /// Embedding cache key of the normalized query
    pub embedding_key: String,
    pub normalized_query: String,
    /// Ranked, truncated to top_k
    pub items: Vec<RankedItem>,
    /// Length of the prefix of `items` that fits the character budget
    pub selected_count: usize,
    pub used_chars: usize,
    pub sources_queried: Vec<RetrievalSource>,
    pub degraded: Vec<DegradedSource>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl RankedContext {
    pub fn selected(&self) -> &[RankedItem] {
        &self.items[..self.selected_count]
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Sources that actually answered
    pub fn sources_answered(&self) -> Vec<RetrievalSource> {
        self.sources_queried
            .iter()
            .copied()
            .filter(|s| !self.degraded.iter().any(|d| d.source == *s))
            .collect()
    }
}

/// Score desc, then configured source order, then newest, then document id
pub fn compare_ranked(config: &RetrieverConfig, a: &RankedItem, b: &RankedItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| config.source_rank(a.source).cmp(&config.source_rank(b.source)))
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.document_id.cmp(&b.document_id))
}

pub struct Retriever {
    db: Arc<MemoryDatabase>,
    cache: Arc<EmbeddingCache>,
    index: Arc<dyn VectorIndex>,
    memory: Arc<MemoryManager>,
    config: RetrieverConfig,
    model_id: String,
    clock: Arc<dyn Clock>,
}

impl Retriever {
    pub fn new(
        db: Arc<MemoryDatabase>,
        cache: Arc<EmbeddingCache>,
        index: Arc<dyn VectorIndex>,
        memory: Arc<MemoryManager>,
        config: RetrieverConfig,
        model_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            db,
            cache,
            index,
            memory,
            config,
            model_id: model_id.into(),
            clock,
        })
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Check a request without touching any provider or index.
    /// Returns the effective `top_k`.
    pub fn validate_request(&self, request: &RetrievalRequest) -> RagResult<usize> {
        if TextUtils::normalize_for_embedding(&request.query).is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }
        if TextUtils::char_len(&request.query) > self.config.max_query_chars {
            return Err(RagError::validation(format!(
                "query exceeds {} characters",
                self.config.max_query_chars
            )));
        }
        if request.user_id.trim().is_empty() {
            return Err(RagError::validation("user id must not be empty"));
        }
        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(RagError::validation(format!(
                "top_k must be between 1 and {}",
                self.config.max_top_k
            )));
        }
        if !request.filters.allows(RetrievalSource::Knowledge)
            && (request.conversation_id.is_none() || !request.filters.allows(RetrievalSource::Memory))
        {
            return Err(RagError::validation("filters exclude every retrieval source"));
        }
        if let Some(conversation_id) = &request.conversation_id {
            if self.db.conversations.get_conversation(conversation_id)?.is_none() {
                return Err(RagError::not_found("conversation", conversation_id.as_str()));
            }
        }
        Ok(top_k)
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> RagResult<RankedContext> {
        let started = Instant::now();
        let now = self.clock.now();
        let top_k = self.validate_request(request)?;
        let lookup = self.cache.get_at(&request.query, &self.model_id, now).await?;
        let fetch = top_k * self.config.overfetch_factor;

        let query_knowledge = request.filters.allows(RetrievalSource::Knowledge);
        let query_memory = request.conversation_id.is_some() && request.filters.allows(RetrievalSource::Memory);

        let knowledge = async {
            if !query_knowledge {
                return None;
            }
            Some(self.knowledge_candidates(&lookup.vector, fetch, request).await)
        };
        let memory = async {
            let conversation_id = request.conversation_id.as_deref().filter(|_| query_memory)?;
            let search = self
                .memory
                .search_summaries(&lookup.vector, conversation_id, request.filters.tiers.clone());
            Some(timed(self.config.query_timeout, "memory query", search).await)
        };
        let (knowledge, memory) = tokio::join!(knowledge, memory);

        let mut items = Vec::new();
        let mut sources_queried = Vec::new();
        let mut degraded = Vec::new();

        if let Some(result) = knowledge {
            sources_queried.push(RetrievalSource::Knowledge);
            match result {
                Ok(found) => items.extend(found),
                Err(e) => {
                    warn!("Knowledge retrieval failed: {}", e);
                    degraded.push(DegradedSource {
                        source: RetrievalSource::Knowledge,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if let Some(result) = memory {
            sources_queried.push(RetrievalSource::Memory);
            match result {
                Ok(found) => items.extend(found.into_iter().take(fetch).map(|scored| RankedItem {
                    document_id: summary_vector_id(&scored.summary.id),
                    source: RetrievalSource::Memory,
                    score: scored.score,
                    metadata: DocumentMetadata::summary(&scored.summary),
                    updated_at: scored.summary.created_at,
                    content: scored.summary.content,
                })),
                Err(e) => {
                    warn!("Memory retrieval failed: {}", e);
                    degraded.push(DegradedSource {
                        source: RetrievalSource::Memory,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if degraded.len() == sources_queried.len() {
            let reasons: Vec<String> = degraded.iter().map(|d| format!("{}: {}", d.source, d.reason)).collect();
            return Err(RagError::RetrievalUnavailable(reasons.join("; ")));
        }
        for d in &degraded {
            metrics::inc_retrieval_degraded(d.source.as_str());
        }

        items.sort_by(|a, b| compare_ranked(&self.config, a, b));
        items.truncate(top_k);

        let budget = request.budget_chars.unwrap_or(self.config.context_budget_chars);
        let (selected_count, used_chars) = select_prefix(&items, budget);

        let used_summaries: Vec<String> = items[..selected_count]
            .iter()
            .filter_map(|item| item.metadata.summary_id.clone())
            .collect();
        if let Err(e) = self.db.summaries.touch(&used_summaries, now) {
            warn!("Failed to update summary access times: {}", e);
        }

        let elapsed = started.elapsed();
        metrics::observe_retrieval_latency(elapsed.as_secs_f64());
        info!(
            "Retrieved {} items ({} in context) for user {} in {:?}{}",
            items.len(),
            selected_count,
            request.user_id,
            elapsed,
            if degraded.is_empty() { "" } else { " (degraded)" }
        );

        Ok(RankedContext {
            query: request.query.clone(),
            user_id: request.user_id.clone(),
            conversation_id: request.conversation_id.clone(),
            embedding_key: lookup.key,
            normalized_query: lookup.normalized_text,
            items,
            selected_count,
            used_chars,
            sources_queried,
            degraded,
            started_at: now,
            elapsed,
        })
    }

    /// Chunk matches owned by the requesting user, resolved to their current text.
    /// Vectors whose chunk row is gone (deleted items) are dropped.
    async fn knowledge_candidates(
        &self,
        vector: &[f32],
        fetch: usize,
        request: &RetrievalRequest,
    ) -> anyhow::Result<Vec<RankedItem>> {
        let filter = MetadataFilter {
            knowledge_item_ids: request.filters.knowledge_item_ids.clone(),
            updated_after: request.filters.updated_after,
            ..MetadataFilter::knowledge_for_owner(&request.user_id)
        };
        let matches = timed(
            self.config.query_timeout,
            "knowledge query",
            self.index.query(vector, fetch, &filter),
        )
        .await?;

        let mut items = Vec::with_capacity(matches.len());
        for m in matches {
            match self.db.knowledge.resolve_chunk(&m.id)? {
                Some((chunk, owner_id, updated_at)) if owner_id == request.user_id => items.push(RankedItem {
                    document_id: m.id,
                    source: RetrievalSource::Knowledge,
                    score: m.score,
                    content: chunk.content,
                    metadata: m.metadata,
                    updated_at,
                }),
                _ => debug!("Skipping orphaned knowledge vector {}", m.id),
            }
        }
        Ok(items)
    }
}
