//! Process-local vector index with exact cosine search
use async_trait::async_trait;
use dashmap::DashMap;
use rayon::prelude::*;

use super::{compare_matches, cosine_similarity, validate_vector, MetadataFilter, VectorIndex, VectorMatch};
use crate::memory_db::DocumentMetadata;

/// Entry counts below this are scored on the calling thread
const PARALLEL_SCAN_THRESHOLD: usize = 2048;

struct StoredVector {
    vector: Vec<f32>,
    metadata: DocumentMetadata,
}

#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: DashMap<String, StoredVector>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn scan(&self, vector: &[f32], filter: &MetadataFilter) -> Vec<VectorMatch> {
        let score = |entry: dashmap::mapref::multiple::RefMulti<'_, String, StoredVector>| {
            let stored = entry.value();
            if !filter.matches(&stored.metadata) {
                return None;
            }
            Some(VectorMatch {
                id: entry.key().clone(),
                score: cosine_similarity(vector, &stored.vector),
                metadata: stored.metadata.clone(),
            })
        };

        if self.entries.len() < PARALLEL_SCAN_THRESHOLD {
            self.entries.iter().filter_map(score).collect()
        } else {
            self.entries.par_iter().filter_map(score).collect()
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: DocumentMetadata) -> anyhow::Result<()> {
        validate_vector(vector)?;
        self.entries.insert(
            id.to_string(),
            StoredVector {
                vector: vector.to_vec(),
                metadata,
            },
        );
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        validate_vector(vector)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut matches = self.scan(vector, filter);
        matches.sort_by(compare_matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, ids: &[String]) -> anyhow::Result<()> {
        for id in ids {
            self.entries.remove(id);
        }
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{ConversationSummary, SummaryTier};
    use chrono::{TimeZone, Utc};

    fn knowledge(owner: &str, item: &str) -> DocumentMetadata {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        DocumentMetadata::knowledge_chunk(owner, item, 0, ts)
    }

    #[tokio::test]
    async fn test_query_respects_filter_and_order() {
        let index = InMemoryVectorIndex::new();
        index.upsert("a", &[1.0, 0.0], knowledge("u1", "k1")).await.unwrap();
        index.upsert("b", &[0.7, 0.7], knowledge("u1", "k2")).await.unwrap();
        index.upsert("c", &[1.0, 0.0], knowledge("u2", "k3")).await.unwrap();

        let results = index
            .query(&[1.0, 0.0], 10, &MetadataFilter::knowledge_for_owner("u1"))
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_filtered_items_do_not_consume_slots() {
        let index = InMemoryVectorIndex::new();
        index.upsert("other", &[1.0, 0.0], knowledge("u2", "k1")).await.unwrap();
        index.upsert("mine", &[0.0, 1.0], knowledge("u1", "k2")).await.unwrap();

        let results = index
            .query(&[1.0, 0.0], 1, &MetadataFilter::knowledge_for_owner("u1"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mine");
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let index = InMemoryVectorIndex::new();
        index.upsert("a", &[1.0, 0.0], knowledge("u1", "k1")).await.unwrap();
        index.upsert("a", &[0.0, 1.0], knowledge("u1", "k1")).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);

        let results = index.query(&[0.0, 1.0], 1, &MetadataFilter::default()).await.unwrap();
        assert!((results[0].score - 1.0).abs() < 1e-6);

        index.delete(&["a".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_summary_namespace() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let summary = ConversationSummary {
            id: "s1".into(),
            conversation_id: "c1".into(),
            content: "talked about paris".into(),
            tier: SummaryTier::ShortTerm,
            start_message_id: "m1".into(),
            end_message_id: "m10".into(),
            start_seq: 1,
            end_seq: 10,
            embedding_ref: None,
            superseded_by: None,
            created_at: ts,
            priority: 1,
            last_accessed: ts,
        };
        let index = InMemoryVectorIndex::new();
        index.upsert("summary:s1", &[1.0, 0.0], DocumentMetadata::summary(&summary)).await.unwrap();
        index.upsert("k1#0", &[1.0, 0.0], knowledge("u1", "k1")).await.unwrap();

        let results = index
            .query(&[1.0, 0.0], 5, &MetadataFilter::memory_for_conversation("c1"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.summary_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_vectors() {
        let index = InMemoryVectorIndex::new();
        assert!(index.upsert("a", &[], knowledge("u1", "k1")).await.is_err());
        assert!(index.upsert("a", &[f32::NAN], knowledge("u1", "k1")).await.is_err());
    }
}
