//! Vector similarity index abstraction
//!
//! Vectors carry a `DocumentMetadata` record; queries combine cosine
//! similarity with a structured `MetadataFilter` so that knowledge chunks
//! and conversation summaries can share one index.

pub mod memory_index;
pub mod sqlite_index;

pub use memory_index::InMemoryVectorIndex;
pub use sqlite_index::SqliteVectorIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::memory_db::{DocumentMetadata, MemoryDatabase, SummaryTier, VectorKind};
use crate::metrics;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    pub metadata: DocumentMetadata,
}

/// Which index implementation backs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for VectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(anyhow::anyhow!("unknown vector backend {other:?}")),
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector stored under `id`
    async fn upsert(&self, id: &str, vector: &[f32], metadata: DocumentMetadata) -> anyhow::Result<()>;

    /// Best `top_k` matches passing `filter`, highest score first, ties by id
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> anyhow::Result<Vec<VectorMatch>>;

    /// Remove vectors; unknown ids are ignored
    async fn delete(&self, ids: &[String]) -> anyhow::Result<()>;

    async fn len(&self) -> anyhow::Result<usize>;

    fn backend_name(&self) -> &'static str;
}

/// Structured filter over `DocumentMetadata`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub kind: Option<VectorKind>,
    pub owner_id: Option<String>,
    pub conversation_id: Option<String>,
    pub knowledge_item_ids: Option<Vec<String>>,
    pub tiers: Option<Vec<SummaryTier>>,
    pub updated_after: Option<DateTime<Utc>>,
}

impl MetadataFilter {
    /// Knowledge chunks owned by one user
    pub fn knowledge_for_owner(owner_id: &str) -> Self {
        Self {
            kind: Some(VectorKind::KnowledgeChunk),
            owner_id: Some(owner_id.to_string()),
            ..Default::default()
        }
    }

    /// Summaries of one conversation
    pub fn memory_for_conversation(conversation_id: &str) -> Self {
        Self {
            kind: Some(VectorKind::Summary),
            conversation_id: Some(conversation_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        if let Some(kind) = self.kind {
            if metadata.kind != kind {
                return false;
            }
        }
        if let Some(owner) = &self.owner_id {
            if metadata.owner_id.as_ref() != Some(owner) {
                return false;
            }
        }
        if let Some(conversation) = &self.conversation_id {
            if metadata.conversation_id.as_ref() != Some(conversation) {
                return false;
            }
        }
        if let Some(items) = &self.knowledge_item_ids {
            match &metadata.knowledge_item_id {
                Some(item) if items.contains(item) => {}
                _ => return false,
            }
        }
        if let Some(tiers) = &self.tiers {
            match metadata.tier {
                Some(tier) if tiers.contains(&tier) => {}
                _ => return false,
            }
        }
        if let Some(after) = self.updated_after {
            if metadata.updated_at <= after {
                return false;
            }
        }
        true
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Score descending, then id ascending
pub(crate) fn compare_matches(a: &VectorMatch, b: &VectorMatch) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
}

pub(crate) fn validate_vector(vector: &[f32]) -> anyhow::Result<()> {
    if vector.is_empty() {
        anyhow::bail!("vector must not be empty");
    }
    if vector.iter().any(|v| !v.is_finite()) {
        anyhow::bail!("vector contains non-finite values");
    }
    Ok(())
}

/// Bound an index call by `timeout`
pub(crate) async fn timed<T>(
    timeout: Duration,
    op: &str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("vector index {} timed out after {:?}", op, timeout)),
    }
}

/// Delete vectors, queueing them for reconciliation when the index refuses.
/// Returns the ids left behind in the index.
pub(crate) async fn delete_or_reconcile(
    index: &dyn VectorIndex,
    db: &MemoryDatabase,
    ids: &[String],
    reason: &str,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<String> {
    if ids.is_empty() {
        return Vec::new();
    }
    match timed(timeout, "delete", index.delete(ids)).await {
        Ok(()) => Vec::new(),
        Err(e) => {
            warn!(
                "Failed to delete {} vectors ({}): {}; queueing for reconciliation",
                ids.len(),
                reason,
                e
            );
            match db.reconciliation.enqueue(ids, reason, now) {
                Ok(queued) => metrics::inc_reconciliation_queued(queued as u64),
                Err(e) => warn!("Failed to queue orphaned vectors {:?}: {}", ids, e),
            }
            ids.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_filter_matching() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let meta = DocumentMetadata::knowledge_chunk("u1", "k1", 0, ts);

        assert!(MetadataFilter::knowledge_for_owner("u1").matches(&meta));
        assert!(!MetadataFilter::knowledge_for_owner("u2").matches(&meta));
        assert!(!MetadataFilter::memory_for_conversation("c1").matches(&meta));

        let mut by_item = MetadataFilter::knowledge_for_owner("u1");
        by_item.knowledge_item_ids = Some(vec!["k2".to_string()]);
        assert!(!by_item.matches(&meta));

        let mut recent = MetadataFilter::default();
        recent.updated_after = Some(ts);
        assert!(!recent.matches(&meta));
    }

    #[test]
    fn test_match_ordering_breaks_ties_by_id() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let meta = DocumentMetadata::knowledge_chunk("u1", "k1", 0, ts);
        let mut matches = vec![
            VectorMatch { id: "b".into(), score: 0.5, metadata: meta.clone() },
            VectorMatch { id: "a".into(), score: 0.5, metadata: meta.clone() },
            VectorMatch { id: "c".into(), score: 0.9, metadata: meta },
        ];
        matches.sort_by(compare_matches);
        let ids: Vec<_> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
