//! Hierarchical conversation memory
//!
//! Messages are summarized in fixed-size batches into short-term summaries.
//! When a tier holds too many active summaries, its oldest run is compacted
//! into one summary of the next tier and the inputs are marked superseded.
//!
//! Appends for one conversation are serialized by a conversation-scoped
//! mutex. Summarization runs outside that lock and commits only if the
//! conversation's summary cursor has not moved in the meantime. Every append
//! keeps summarizing until fewer than `threshold` messages are pending, so a
//! lost compare-and-set never leaves a full batch behind.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::summarizer::{Summarizer, SummaryInput};
use crate::cache_management::EmbeddingCache;
use crate::error::{RagError, RagResult};
use crate::memory_db::{
    summary_vector_id, Conversation, ConversationStore, ConversationSummary, DocumentMetadata, MemoryDatabase,
    Message, Role, SummaryStore, SummaryTier, MAX_SUMMARY_PRIORITY, MIN_SUMMARY_PRIORITY,
};
use crate::metrics;
use crate::utils::{Clock, TextUtils};
use crate::vector_index::{delete_or_reconcile, timed, MetadataFilter, VectorIndex};

/// Candidates fetched from the index before relational filtering
const MEMORY_OVERFETCH: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationConfig {
    /// Unsummarized messages that trigger a short-term summary
    pub threshold: usize,
    pub max_short_term: usize,
    pub max_medium_term: usize,
    /// Summaries compacted into one summary of the next tier
    pub promotion_batch: usize,
    /// Unsummarized messages appended to retrieved memory
    pub recent_message_count: usize,
    pub default_priority: u8,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            max_short_term: 5,
            max_medium_term: 5,
            promotion_batch: 3,
            recent_message_count: 4,
            default_priority: MIN_SUMMARY_PRIORITY,
        }
    }
}

impl SummarizationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threshold == 0 {
            anyhow::bail!("summarization threshold must be at least 1");
        }
        if self.promotion_batch < 2 {
            anyhow::bail!("promotion_batch must be at least 2");
        }
        if self.promotion_batch > self.max_short_term || self.promotion_batch > self.max_medium_term {
            anyhow::bail!(
                "promotion_batch ({}) must not exceed max_short_term ({}) or max_medium_term ({})",
                self.promotion_batch,
                self.max_short_term,
                self.max_medium_term
            );
        }
        validate_priority(self.default_priority)?;
        Ok(())
    }

    fn max_active(&self, tier: SummaryTier) -> Option<usize> {
        match tier {
            SummaryTier::ShortTerm => Some(self.max_short_term),
            SummaryTier::MediumTerm => Some(self.max_medium_term),
            SummaryTier::LongTerm => None,
        }
    }
}

fn validate_priority(priority: u8) -> anyhow::Result<()> {
    if !(MIN_SUMMARY_PRIORITY..=MAX_SUMMARY_PRIORITY).contains(&priority) {
        anyhow::bail!(
            "priority {} outside {}..={}",
            priority,
            MIN_SUMMARY_PRIORITY,
            MAX_SUMMARY_PRIORITY
        );
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    pub message: Message,
    /// Summaries committed as a consequence of this append, promotions included
    pub summaries_created: Vec<ConversationSummary>,
}

enum BatchOutcome {
    Committed(ConversationSummary),
    CursorMoved,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSummary {
    pub summary: ConversationSummary,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    /// Best first
    pub summaries: Vec<ScoredSummary>,
    /// Chronological
    pub recent_messages: Vec<Message>,
    pub used_chars: usize,
}

/// Material for the prompt of the next turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveContext {
    /// Chronological by message range
    pub summaries: Vec<ConversationSummary>,
    pub recent_messages: Vec<Message>,
    pub evicted: Vec<String>,
}

/// Similarity desc, then priority desc, then last access desc, then id
pub fn compare_scored(a: &ScoredSummary, b: &ScoredSummary) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.summary.priority.cmp(&a.summary.priority))
        .then_with(|| b.summary.last_accessed.cmp(&a.summary.last_accessed))
        .then_with(|| a.summary.id.cmp(&b.summary.id))
}

/// Ids of the summaries to drop so the rest fit in `budget_chars`.
///
/// Victims go lowest priority first, then least recently accessed. The most
/// recent short-term summary is never chosen, even if the budget stays blown.
pub fn plan_eviction(summaries: &[ConversationSummary], budget_chars: usize) -> Vec<String> {
    let mut total: usize = summaries.iter().map(|s| TextUtils::char_len(&s.content)).sum();
    if total <= budget_chars {
        return Vec::new();
    }
    let protected = summaries
        .iter()
        .filter(|s| s.tier == SummaryTier::ShortTerm)
        .max_by_key(|s| s.end_seq)
        .map(|s| s.id.as_str());

    let mut candidates: Vec<&ConversationSummary> = summaries
        .iter()
        .filter(|s| Some(s.id.as_str()) != protected)
        .collect();
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.last_accessed.cmp(&b.last_accessed))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut evicted = Vec::new();
    for candidate in candidates {
        if total <= budget_chars {
            break;
        }
        total -= TextUtils::char_len(&candidate.content);
        evicted.push(candidate.id.clone());
    }
    evicted
}

pub struct MemoryManager {
    db: Arc<MemoryDatabase>,
    cache: Arc<EmbeddingCache>,
    index: Arc<dyn VectorIndex>,
    summarizer: Arc<dyn Summarizer>,
    config: SummarizationConfig,
    model_id: String,
    clock: Arc<dyn Clock>,
    vector_timeout: Duration,
    conversation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<MemoryDatabase>,
        cache: Arc<EmbeddingCache>,
        index: Arc<dyn VectorIndex>,
        summarizer: Arc<dyn Summarizer>,
        config: SummarizationConfig,
        model_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        vector_timeout: Duration,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            db,
            cache,
            index,
            summarizer,
            config,
            model_id: model_id.into(),
            clock,
            vector_timeout,
            conversation_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.conversation_locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    pub fn create_conversation(
        &self,
        owner_id: Option<&str>,
        system_prompt_id: Option<&str>,
    ) -> RagResult<Conversation> {
        let conversation = self
            .db
            .conversations
            .create_conversation(owner_id, system_prompt_id, self.clock.now())?;
        info!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> RagResult<Conversation> {
        self.db
            .conversations
            .get_conversation(conversation_id)?
            .ok_or_else(|| RagError::not_found("conversation", conversation_id))
    }

    /// Delete a conversation with its messages and summaries, and drop the summary vectors
    pub async fn delete_conversation(&self, conversation_id: &str) -> RagResult<()> {
        let vector_ids: Vec<String> = self
            .db
            .summaries
            .get_all_summaries(conversation_id)?
            .into_iter()
            .filter_map(|s| s.embedding_ref)
            .collect();
        if !self.db.conversations.delete_conversation(conversation_id)? {
            return Err(RagError::not_found("conversation", conversation_id));
        }
        self.conversation_locks.remove(conversation_id);
        delete_or_reconcile(
            self.index.as_ref(),
            &self.db,
            &vector_ids,
            "conversation_deleted",
            self.clock.now(),
            self.vector_timeout,
        )
        .await;
        Ok(())
    }

    pub async fn append_message(&self, conversation_id: &str, role: Role, content: &str) -> RagResult<AppendOutcome> {
        self.append_message_at(conversation_id, role, content, self.clock.now()).await
    }

    /// Append a message, then summarize if enough messages are waiting
    pub async fn append_message_at(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        now: DateTime<Utc>,
    ) -> RagResult<AppendOutcome> {
        if content.trim().is_empty() {
            return Err(RagError::validation("message content must not be empty"));
        }

        let lock = self.conversation_lock(conversation_id);
        let (message, mut pending) = {
            let _guard = lock.lock().await;
            let message = self
                .db
                .conversations
                .append_message(conversation_id, role, content, now)?
                .ok_or_else(|| RagError::not_found("conversation", conversation_id))?;
            let pending = self.pending_batch(conversation_id)?;
            (message, pending)
        };

        let mut summaries_created = Vec::new();
        while let Some((cursor, batch)) = pending {
            match self.summarize_batch(conversation_id, cursor, batch, now).await? {
                BatchOutcome::Committed(summary) => {
                    summaries_created.push(summary);
                    summaries_created.extend(self.promote(conversation_id, now).await?);
                }
                // Another append committed first; the cursor has advanced
                BatchOutcome::CursorMoved => {}
                BatchOutcome::Failed => break,
            }
            pending = self.pending_batch(conversation_id)?;
        }
        Ok(AppendOutcome {
            message,
            summaries_created,
        })
    }

    /// The oldest `threshold` unsummarized messages, once that many exist
    fn pending_batch(&self, conversation_id: &str) -> RagResult<Option<(i64, Vec<Message>)>> {
        let conversation = self.get_conversation(conversation_id)?;
        let cursor = conversation.last_summarized_seq;
        let batch = self
            .db
            .conversations
            .get_messages_after(conversation_id, cursor, self.config.threshold)?;
        Ok((batch.len() >= self.config.threshold).then_some((cursor, batch)))
    }

    async fn summarize_batch(
        &self,
        conversation_id: &str,
        expected_cursor: i64,
        batch: Vec<Message>,
        now: DateTime<Utc>,
    ) -> RagResult<BatchOutcome> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(BatchOutcome::Failed);
        };
        let content = match self
            .summarizer
            .summarize(SummaryInput::Messages(&batch), SummaryTier::ShortTerm)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                warn!("Summarization of conversation {} failed: {}", conversation_id, e);
                return Ok(BatchOutcome::Failed);
            }
        };

        let mut summary = ConversationSummary {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content,
            tier: SummaryTier::ShortTerm,
            start_message_id: first.id.clone(),
            end_message_id: last.id.clone(),
            start_seq: first.seq,
            end_seq: last.seq,
            embedding_ref: None,
            superseded_by: None,
            created_at: now,
            priority: self.config.default_priority,
            last_accessed: now,
        };

        let committed = self.db.with_transaction(|tx| {
            let advanced = ConversationStore::advance_summary_cursor_with_conn(
                tx,
                conversation_id,
                expected_cursor,
                last.seq,
                last.created_at,
            )?;
            if advanced {
                SummaryStore::insert_summary_with_conn(tx, &summary)?;
            }
            Ok(advanced)
        })?;
        if !committed {
            debug!(
                "Summary cursor of conversation {} moved past {}, discarding summary",
                conversation_id, expected_cursor
            );
            return Ok(BatchOutcome::CursorMoved);
        }

        info!(
            "Summarized messages {}..={} of conversation {}",
            summary.start_seq, summary.end_seq, conversation_id
        );
        metrics::inc_summaries_created(SummaryTier::ShortTerm.as_str());
        self.embed_summary(&mut summary, now).await;
        Ok(BatchOutcome::Committed(summary))
    }

    /// Compact over-full tiers, lowest tier first
    async fn promote(&self, conversation_id: &str, now: DateTime<Utc>) -> RagResult<Vec<ConversationSummary>> {
        let mut created = Vec::new();
        for tier in [SummaryTier::ShortTerm, SummaryTier::MediumTerm] {
            let (Some(max_active), Some(next)) = (self.config.max_active(tier), tier.next()) else {
                continue;
            };
            loop {
                let active = self.db.summaries.get_active_summaries(conversation_id, Some(tier))?;
                if active.len() <= max_active {
                    break;
                }
                let batch = &active[..self.config.promotion_batch];
                match self.compact(conversation_id, batch, next, now).await? {
                    Some(summary) => created.push(summary),
                    None => break,
                }
            }
        }
        Ok(created)
    }

    async fn compact(
        &self,
        conversation_id: &str,
        batch: &[ConversationSummary],
        tier: SummaryTier,
        now: DateTime<Utc>,
    ) -> RagResult<Option<ConversationSummary>> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(None);
        };
        let content = match self.summarizer.summarize(SummaryInput::Summaries(batch), tier).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Promotion to {} for conversation {} failed: {}", tier, conversation_id, e);
                return Ok(None);
            }
        };

        let mut summary = ConversationSummary {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content,
            tier,
            start_message_id: first.start_message_id.clone(),
            end_message_id: last.end_message_id.clone(),
            start_seq: first.start_seq,
            end_seq: last.end_seq,
            embedding_ref: None,
            superseded_by: None,
            created_at: now,
            priority: batch.iter().map(|s| s.priority).max().unwrap_or(self.config.default_priority),
            last_accessed: now,
        };
        let input_ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();

        let committed = self.db.with_transaction(|tx| {
            SummaryStore::insert_summary_with_conn(tx, &summary)?;
            let marked = SummaryStore::mark_superseded_with_conn(tx, &input_ids, &summary.id)?;
            if marked != input_ids.len() {
                anyhow::bail!("{} of {} summaries were already compacted", input_ids.len() - marked, input_ids.len());
            }
            Ok(())
        });
        if let Err(e) = committed {
            debug!("Promotion for conversation {} abandoned: {}", conversation_id, e);
            return Ok(None);
        }

        info!(
            "Compacted {} summaries of conversation {} into {} summary {}",
            batch.len(),
            conversation_id,
            tier,
            summary.id
        );
        metrics::inc_summaries_created(tier.as_str());

        let superseded_vectors: Vec<String> = batch.iter().filter_map(|s| s.embedding_ref.clone()).collect();
        delete_or_reconcile(
            self.index.as_ref(),
            &self.db,
            &superseded_vectors,
            "summary_superseded",
            now,
            self.vector_timeout,
        )
        .await;
        self.embed_summary(&mut summary, now).await;
        Ok(Some(summary))
    }

    /// Embed and index a summary. Failures leave `embedding_ref` empty for
    /// `backfill_embeddings`.
    async fn embed_summary(&self, summary: &mut ConversationSummary, now: DateTime<Utc>) -> bool {
        let lookup = match self.cache.get_at(&summary.content, &self.model_id, now).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!("Failed to embed summary {}: {}", summary.id, e);
                return false;
            }
        };
        let vector_id = summary_vector_id(&summary.id);
        let upsert = self
            .index
            .upsert(&vector_id, &lookup.vector, DocumentMetadata::summary(summary));
        if let Err(e) = timed(self.vector_timeout, "upsert", upsert).await {
            warn!("Failed to index summary {}: {}", summary.id, e);
            return false;
        }
        if let Err(e) = self.db.summaries.set_embedding_ref(&summary.id, &vector_id) {
            warn!("Failed to record embedding of summary {}: {}", summary.id, e);
            return false;
        }
        summary.embedding_ref = Some(vector_id);
        true
    }

    /// Active summaries of a conversation closest to `vector`, best first
    pub async fn search_summaries(
        &self,
        vector: &[f32],
        conversation_id: &str,
        tiers: Option<Vec<SummaryTier>>,
    ) -> anyhow::Result<Vec<ScoredSummary>> {
        let filter = MetadataFilter {
            tiers,
            ..MetadataFilter::memory_for_conversation(conversation_id)
        };
        let matches = timed(
            self.vector_timeout,
            "query",
            self.index.query(vector, MEMORY_OVERFETCH, &filter),
        )
        .await?;

        let mut scored = Vec::with_capacity(matches.len());
        for m in matches {
            let Some(summary_id) = m.metadata.summary_id.as_deref() else {
                continue;
            };
            match self.db.summaries.get_summary(summary_id)? {
                Some(summary) if summary.is_active() => scored.push(ScoredSummary {
                    summary,
                    score: m.score,
                }),
                _ => debug!("Skipping stale summary vector {}", m.id),
            }
        }
        scored.sort_by(compare_scored);
        Ok(scored)
    }

    /// Summaries most relevant to `query`, filled greedily into
    /// `budget_chars`, followed by recent unsummarized messages that still fit
    pub async fn retrieve_relevant_memory(
        &self,
        query: &str,
        conversation_id: &str,
        budget_chars: usize,
        now: DateTime<Utc>,
    ) -> RagResult<MemoryContext> {
        let conversation = self.get_conversation(conversation_id)?;
        let lookup = self.cache.get_at(query, &self.model_id, now).await?;
        let candidates = self
            .search_summaries(&lookup.vector, conversation_id, None)
            .await
            .map_err(|e| RagError::RetrievalUnavailable(e.to_string()))?;

        let mut context = MemoryContext::default();
        for candidate in candidates {
            let len = TextUtils::char_len(&candidate.summary.content);
            if context.used_chars + len > budget_chars {
                continue;
            }
            context.used_chars += len;
            context.summaries.push(candidate);
        }

        let selected: Vec<String> = context.summaries.iter().map(|s| s.summary.id.clone()).collect();
        self.db.summaries.touch(&selected, now)?;
        for scored in &mut context.summaries {
            scored.summary.last_accessed = now;
        }

        if self.config.recent_message_count > 0 {
            let recent = self.db.conversations.get_latest_messages(
                conversation_id,
                conversation.last_summarized_seq,
                self.config.recent_message_count,
            )?;
            // Newest first, stopping at the first that does not fit
            for message in recent.into_iter().rev() {
                let len = TextUtils::char_len(&message.content);
                if context.used_chars + len > budget_chars {
                    break;
                }
                context.used_chars += len;
                context.recent_messages.push(message);
            }
            context.recent_messages.reverse();
        }
        debug!(
            "Memory for conversation {}: {} summaries, {} recent messages, {} chars",
            conversation_id,
            context.summaries.len(),
            context.recent_messages.len(),
            context.used_chars
        );
        Ok(context)
    }

    /// Summaries and unsummarized messages for the next prompt.
    ///
    /// Unsummarized messages are kept newest first while they fit; the
    /// summaries then share what is left, evicting by `plan_eviction`.
    pub fn active_context(&self, conversation_id: &str, budget_chars: usize) -> RagResult<ActiveContext> {
        let conversation = self.get_conversation(conversation_id)?;
        let unsummarized = self
            .db
            .conversations
            .get_messages_after(conversation_id, conversation.last_summarized_seq, usize::MAX >> 1)?;

        let mut used = 0;
        let mut recent_messages = Vec::new();
        for message in unsummarized.into_iter().rev() {
            let len = TextUtils::char_len(&message.content);
            if used + len > budget_chars {
                break;
            }
            used += len;
            recent_messages.push(message);
        }
        recent_messages.reverse();

        let active = self.db.summaries.get_active_summaries(conversation_id, None)?;
        let evicted = plan_eviction(&active, budget_chars - used);
        let summaries = active.into_iter().filter(|s| !evicted.contains(&s.id)).collect();
        Ok(ActiveContext {
            summaries,
            recent_messages,
            evicted,
        })
    }

    /// Permanently delete the summaries `plan_eviction` picks for `budget_chars`
    pub async fn enforce_retention(&self, conversation_id: &str, budget_chars: usize) -> RagResult<Vec<String>> {
        let active = self.db.summaries.get_active_summaries(conversation_id, None)?;
        let evicted = plan_eviction(&active, budget_chars);
        if evicted.is_empty() {
            return Ok(evicted);
        }
        let vector_ids: Vec<String> = active
            .iter()
            .filter(|s| evicted.contains(&s.id))
            .filter_map(|s| s.embedding_ref.clone())
            .collect();
        self.db.summaries.delete_summaries(&evicted)?;
        delete_or_reconcile(
            self.index.as_ref(),
            &self.db,
            &vector_ids,
            "summary_evicted",
            self.clock.now(),
            self.vector_timeout,
        )
        .await;
        info!("Evicted {} summaries from conversation {}", evicted.len(), conversation_id);
        Ok(evicted)
    }

    pub fn set_priority(&self, summary_id: &str, priority: u8) -> RagResult<()> {
        validate_priority(priority).map_err(|e| RagError::validation(e.to_string()))?;
        if !self.db.summaries.set_priority(summary_id, priority)? {
            return Err(RagError::not_found("summary", summary_id));
        }
        Ok(())
    }

    /// Replace a summary's text and re-embed it
    pub async fn revise_summary(&self, summary_id: &str, content: &str) -> RagResult<ConversationSummary> {
        if content.trim().is_empty() {
            return Err(RagError::validation("summary content must not be empty"));
        }
        if !self.db.summaries.update_content(summary_id, content)? {
            return Err(RagError::not_found("summary", summary_id));
        }
        let mut summary = self
            .db
            .summaries
            .get_summary(summary_id)?
            .ok_or_else(|| RagError::not_found("summary", summary_id))?;
        if summary.is_active() {
            self.embed_summary(&mut summary, self.clock.now()).await;
        }
        Ok(summary)
    }

    /// Embed active summaries that have no vector yet. Returns how many succeeded.
    pub async fn backfill_embeddings(&self, limit: usize) -> RagResult<usize> {
        let now = self.clock.now();
        let mut embedded = 0;
        for mut summary in self.db.summaries.get_missing_embeddings(limit)? {
            if self.embed_summary(&mut summary, now).await {
                embedded += 1;
            }
        }
        if embedded > 0 {
            info!("Backfilled embeddings for {} summaries", embedded);
        }
        Ok(embedded)
    }
}
