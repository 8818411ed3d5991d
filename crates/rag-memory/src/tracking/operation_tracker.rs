//! Retrieval audit trail and the analytics computed from it
//!
//! Recording is fire-and-forget: the write runs on the blocking pool, and
//! a failure is logged and counted but never reaches the caller's answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context_engine::RankedContext;
use crate::error::{RagError, RagResult};
use crate::memory_db::{
    EmbeddingSource, Feedback, MemoryDatabase, OperationFilter, OperationStore, RagOperation, RetrievalSource,
    RetrievedDocument, TimeRange,
};
use crate::metrics;
use crate::utils::Clock;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub volume: u64,
    pub degraded_count: u64,
    pub latency_p50_ms: Option<u64>,
    pub latency_p95_ms: Option<u64>,
    pub latency_p99_ms: Option<u64>,
    pub mean_latency_ms: Option<f64>,
    pub avg_similarity: Option<f64>,
    /// Mean similarity of the documents that made it into a context
    pub avg_used_similarity: Option<f64>,
    pub documents_per_operation: Option<f64>,
    pub feedback_count: u64,
    /// Mean rating (-1..1) of answers that followed a tracked retrieval
    pub mean_feedback: Option<f64>,
}

/// Nearest-rank percentile of an ascending slice
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Source label of an operation: the sources that answered
pub fn operation_source(context: &RankedContext) -> &'static str {
    let answered = context.sources_answered();
    let knowledge = answered.contains(&RetrievalSource::Knowledge);
    let memory = answered.contains(&RetrievalSource::Memory);
    match (knowledge, memory) {
        (true, true) => "hybrid",
        (false, true) => "memory",
        _ => "knowledge",
    }
}

/// Operation row and its documents, in ranked order
pub fn build_record(
    context: &RankedContext,
    operation_id: &str,
    message_id: Option<&str>,
    embedding_id: Option<i64>,
) -> (RagOperation, Vec<RetrievedDocument>) {
    let operation = RagOperation {
        id: operation_id.to_string(),
        query: context.query.clone(),
        message_id: message_id.map(str::to_string),
        conversation_id: context.conversation_id.clone(),
        user_id: context.user_id.clone(),
        timestamp: context.started_at,
        source: operation_source(context).to_string(),
        degraded: context.is_degraded(),
        operation_time_ms: context.elapsed.as_millis() as u64,
        embedding_id,
    };
    let documents = context
        .items
        .iter()
        .enumerate()
        .map(|(rank, item)| RetrievedDocument {
            id: Uuid::new_v4().to_string(),
            rag_operation_id: operation_id.to_string(),
            rank: rank as u32,
            document_id: item.document_id.clone(),
            similarity_score: item.score,
            content: item.content.clone(),
            source: item.source,
            metadata: Some(item.metadata.clone()),
            used_in_context: rank < context.selected_count,
            timestamp: context.started_at,
        })
        .collect();
    (operation, documents)
}

/// Pending write of one operation
#[derive(Debug)]
pub struct TrackingHandle {
    pub operation_id: String,
    handle: JoinHandle<bool>,
}

impl TrackingHandle {
    /// Wait for the write; `true` when it was stored
    pub async fn wait(self) -> bool {
        self.handle.await.unwrap_or(false)
    }
}

pub struct OperationTracker {
    db: Arc<MemoryDatabase>,
    model_id: String,
    clock: Arc<dyn Clock>,
}

impl OperationTracker {
    pub fn new(db: Arc<MemoryDatabase>, model_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            model_id: model_id.into(),
            clock,
        }
    }

    fn persist(
        db: &MemoryDatabase,
        context: &RankedContext,
        operation_id: &str,
        message_id: Option<&str>,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        db.with_transaction(|tx| {
            let embedding = OperationStore::get_or_create_embedding_with_conn(
                tx,
                &context.normalized_query,
                &context.embedding_key,
                model_id,
                EmbeddingSource::UserQuery,
                now,
            )?;
            let (operation, documents) = build_record(context, operation_id, message_id, Some(embedding.id));
            OperationStore::insert_operation_with_conn(tx, &operation, &documents)
        })
    }

    /// Queue the write of a completed retrieval and return at once
    pub fn record(&self, context: &RankedContext, message_id: Option<&str>) -> TrackingHandle {
        let operation_id = Uuid::new_v4().to_string();
        let db = Arc::clone(&self.db);
        let context = context.clone();
        let message_id = message_id.map(str::to_string);
        let model_id = self.model_id.clone();
        let now = self.clock.now();
        let id = operation_id.clone();

        let handle = tokio::task::spawn_blocking(move || {
            match Self::persist(&db, &context, &id, message_id.as_deref(), &model_id, now) {
                Ok(()) => {
                    debug!("Recorded retrieval {} ({} documents)", id, context.items.len());
                    true
                }
                Err(e) => {
                    warn!("Failed to record retrieval {}: {}", id, e);
                    metrics::inc_tracking_failure();
                    false
                }
            }
        });
        TrackingHandle { operation_id, handle }
    }

    /// Like `record`, but waits and reports failure
    pub async fn record_and_wait(&self, context: &RankedContext, message_id: Option<&str>) -> RagResult<String> {
        let handle = self.record(context, message_id);
        let operation_id = handle.operation_id.clone();
        if handle.wait().await {
            Ok(operation_id)
        } else {
            Err(RagError::TrackingFailure(format!("operation {operation_id} was not stored")))
        }
    }

    pub fn get_operation(&self, operation_id: &str) -> RagResult<(RagOperation, Vec<RetrievedDocument>)> {
        let operation = self
            .db
            .operations
            .get_operation(operation_id)?
            .ok_or_else(|| RagError::not_found("rag operation", operation_id))?;
        let documents = self.db.operations.get_documents(operation_id)?;
        Ok((operation, documents))
    }

    pub fn list_operations(&self, filter: &OperationFilter, range: &TimeRange) -> RagResult<Vec<RagOperation>> {
        Ok(self.db.operations.list_operations(filter, range)?)
    }

    /// Rate an answer. One rating per message, -1 or 1.
    pub fn record_feedback(&self, message_id: &str, rating: i8, comment: Option<&str>) -> RagResult<Feedback> {
        if rating != -1 && rating != 1 {
            return Err(RagError::validation("rating must be -1 or 1"));
        }
        if self.db.conversations.get_message(message_id)?.is_none() {
            return Err(RagError::not_found("message", message_id));
        }
        if self.db.conversations.get_feedback(message_id)?.is_some() {
            return Err(RagError::validation(format!("message {message_id} already has feedback")));
        }
        Ok(self
            .db
            .conversations
            .record_feedback(message_id, rating, comment, self.clock.now())?)
    }

    pub fn aggregate(&self, filter: &OperationFilter, range: &TimeRange) -> RagResult<OperationMetrics> {
        if range.end <= range.start {
            return Err(RagError::validation("time range end must be after its start"));
        }
        let rollup = self.db.operations.rollup(filter, range)?;
        let volume = rollup.latencies_ms.len() as u64;
        let mean_latency_ms = (volume > 0)
            .then(|| rollup.latencies_ms.iter().sum::<u64>() as f64 / volume as f64);
        let documents_per_operation = (volume > 0).then(|| rollup.document_count as f64 / volume as f64);

        Ok(OperationMetrics {
            volume,
            degraded_count: rollup.degraded_count,
            latency_p50_ms: percentile(&rollup.latencies_ms, 50.0),
            latency_p95_ms: percentile(&rollup.latencies_ms, 95.0),
            latency_p99_ms: percentile(&rollup.latencies_ms, 99.0),
            mean_latency_ms,
            avg_similarity: rollup.avg_similarity,
            avg_used_similarity: rollup.avg_used_similarity,
            documents_per_operation,
            feedback_count: rollup.feedback_count,
            mean_feedback: rollup.avg_feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::{DegradedSource, RankedItem};
    use crate::memory_db::{DocumentMetadata, Role};
    use crate::utils::ManualClock;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn context(user: &str, scores: &[f32], selected: usize, elapsed_ms: u64, started: DateTime<Utc>) -> RankedContext {
        let items = scores
            .iter()
            .enumerate()
            .map(|(i, score)| RankedItem {
                document_id: format!("k1#{i}"),
                source: RetrievalSource::Knowledge,
                score: *score,
                content: format!("chunk {i}"),
                metadata: DocumentMetadata::knowledge_chunk(user, "k1", i as u32, started),
                updated_at: started,
            })
            .collect();
        RankedContext {
            query: "What is the capital of France?".to_string(),
            user_id: user.to_string(),
            conversation_id: None,
            embedding_key: format!("key-{elapsed_ms}"),
            normalized_query: "what is the capital of france?".to_string(),
            items,
            selected_count: selected,
            used_chars: 0,
            sources_queried: vec![RetrievalSource::Knowledge],
            degraded: Vec::new(),
            started_at: started,
            elapsed: std::time::Duration::from_millis(elapsed_ms),
        }
    }

    fn tracker() -> (OperationTracker, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(at(0)));
        (OperationTracker::new(db.clone(), "hash-64", clock), db)
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(50));
        assert_eq!(percentile(&sorted, 95.0), Some(95));
        assert_eq!(percentile(&sorted, 99.0), Some(99));
        assert_eq!(percentile(&[7], 99.0), Some(7));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_build_record_keeps_rank_order() {
        let ctx = context("u1", &[0.9, 0.7, 0.4], 2, 12, at(0));
        let (operation, documents) = build_record(&ctx, "op1", Some("m1"), Some(3));
        assert_eq!(operation.source, "knowledge");
        assert_eq!(operation.operation_time_ms, 12);
        let ranks: Vec<(u32, &str, bool)> = documents
            .iter()
            .map(|d| (d.rank, d.document_id.as_str(), d.used_in_context))
            .collect();
        assert_eq!(ranks, vec![(0, "k1#0", true), (1, "k1#1", true), (2, "k1#2", false)]);
    }

    #[test]
    fn test_operation_source_labels() {
        let mut ctx = context("u1", &[], 0, 1, at(0));
        ctx.sources_queried = vec![RetrievalSource::Knowledge, RetrievalSource::Memory];
        assert_eq!(operation_source(&ctx), "hybrid");
        ctx.degraded.push(DegradedSource {
            source: RetrievalSource::Knowledge,
            reason: "down".to_string(),
        });
        assert_eq!(operation_source(&ctx), "memory");
    }

    #[tokio::test]
    async fn test_record_and_aggregate() {
        let (tracker, _db) = tracker();
        for (i, ms) in [10u64, 20, 30, 40].iter().enumerate() {
            let mut ctx = context("u1", &[0.8, 0.6], 1, *ms, at(i as i64));
            if i == 3 {
                ctx.sources_queried.push(RetrievalSource::Memory);
                ctx.degraded.push(DegradedSource {
                    source: RetrievalSource::Memory,
                    reason: "timeout".to_string(),
                });
            }
            tracker.record_and_wait(&ctx, None).await.unwrap();
        }
        tracker
            .record_and_wait(&context("u2", &[0.1], 1, 500, at(1)), None)
            .await
            .unwrap();

        let metrics = tracker
            .aggregate(&OperationFilter::for_user("u1"), &TimeRange::new(at(0), at(60)))
            .unwrap();
        assert_eq!(metrics.volume, 4);
        assert_eq!(metrics.degraded_count, 1);
        assert_eq!(metrics.latency_p50_ms, Some(20));
        assert_eq!(metrics.latency_p99_ms, Some(40));
        assert_eq!(metrics.mean_latency_ms, Some(25.0));
        assert_eq!(metrics.documents_per_operation, Some(2.0));
        assert!((metrics.avg_similarity.unwrap() - 0.7).abs() < 1e-4);
        assert!((metrics.avg_used_similarity.unwrap() - 0.8).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_tracking_failure_is_isolated() {
        let (tracker, db) = tracker();
        db.with_transaction(|tx| Ok(tx.execute_batch("DROP TABLE retrieved_documents")?))
            .unwrap();
        let ctx = context("u1", &[0.5], 1, 5, at(0));
        let handle = tracker.record(&ctx, None);
        assert!(!handle.wait().await);
        assert!(matches!(
            tracker.record_and_wait(&ctx, None).await,
            Err(RagError::TrackingFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_feedback_validation() {
        let (tracker, db) = tracker();
        let conversation = db.conversations.create_conversation(Some("u1"), None, at(0)).unwrap();
        let message = db
            .conversations
            .append_message(&conversation.id, Role::Assistant, "Paris.", at(1))
            .unwrap()
            .unwrap();

        assert!(matches!(tracker.record_feedback(&message.id, 3, None), Err(RagError::Validation(_))));
        assert!(matches!(tracker.record_feedback("nope", 1, None), Err(RagError::NotFound { .. })));
        tracker.record_feedback(&message.id, 1, Some("great")).unwrap();
        assert!(matches!(tracker.record_feedback(&message.id, -1, None), Err(RagError::Validation(_))));
    }
}
