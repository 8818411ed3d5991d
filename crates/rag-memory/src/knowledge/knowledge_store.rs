//! Per-user knowledge items kept in step with their chunk vectors
//!
//! The relational row is the source of truth. Vectors are written before the
//! row commits and removed after it is deleted; removals that fail are queued
//! for `reconcile_orphans`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chunking::{chunk_text, ChunkConfig};
use crate::cache_management::EmbeddingCache;
use crate::error::{RagError, RagResult};
use crate::memory_db::{
    chunk_vector_id, DocumentMetadata, KnowledgeChunk, KnowledgeItem, KnowledgeItemStore, MemoryDatabase,
    ReconciliationStore,
};
use crate::utils::{Clock, TextUtils};
use crate::vector_index::{delete_or_reconcile, timed, VectorIndex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKnowledgeItem {
    /// Generated when absent
    pub id: Option<String>,
    pub owner_id: String,
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeWriteResult {
    pub item: KnowledgeItem,
    pub chunks_written: usize,
    /// Content, chunking and model all matched the stored item
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeDeleteResult {
    pub id: String,
    pub vectors_deleted: usize,
    /// Vector ids left in the index and queued for reconciliation
    pub orphaned: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attempted: usize,
    pub resolved: usize,
    pub remaining: i64,
}

pub struct KnowledgeStore {
    db: Arc<MemoryDatabase>,
    cache: Arc<EmbeddingCache>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkConfig,
    model_id: String,
    clock: Arc<dyn Clock>,
    vector_timeout: Duration,
}

impl KnowledgeStore {
    pub fn new(
        db: Arc<MemoryDatabase>,
        cache: Arc<EmbeddingCache>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkConfig,
        model_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        vector_timeout: Duration,
    ) -> anyhow::Result<Self> {
        chunking.validate()?;
        Ok(Self {
            db,
            cache,
            index,
            chunking,
            model_id: model_id.into(),
            clock,
            vector_timeout,
        })
    }

    pub fn chunk_config(&self) -> &ChunkConfig {
        &self.chunking
    }

    fn content_hash(&self, content: &str) -> String {
        TextUtils::content_hash(&[content, &self.chunking.signature(), &self.model_id])
    }

    pub async fn create(&self, item: NewKnowledgeItem) -> RagResult<KnowledgeWriteResult> {
        if item.owner_id.trim().is_empty() {
            return Err(RagError::validation("knowledge item owner must not be empty"));
        }
        let id = match item.id {
            Some(id) if id.trim().is_empty() => {
                return Err(RagError::validation("knowledge item id must not be empty"));
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        if self.db.knowledge.get_item(&id)?.is_some() {
            return Err(RagError::validation(format!("knowledge item {id} already exists")));
        }

        let now = self.clock.now();
        let record = KnowledgeItem {
            content_hash: self.content_hash(&item.content),
            id,
            owner_id: item.owner_id,
            title: item.title,
            content: item.content,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.write(record, None, now).await
    }

    /// Replace title and content. Unchanged content writes no vectors.
    pub async fn update(&self, id: &str, title: Option<String>, content: String) -> RagResult<KnowledgeWriteResult> {
        let existing = self
            .db
            .knowledge
            .get_item(id)?
            .ok_or_else(|| RagError::not_found("knowledge item", id))?;
        let now = self.clock.now();
        let content_hash = self.content_hash(&content);

        if content_hash == existing.content_hash {
            if title == existing.title {
                debug!("Knowledge item {} unchanged", id);
                return Ok(KnowledgeWriteResult {
                    item: existing,
                    chunks_written: 0,
                    unchanged: true,
                });
            }
            self.db.knowledge.update_title(id, title.as_deref(), now)?;
            let item = KnowledgeItem {
                title,
                updated_at: now,
                ..existing
            };
            return Ok(KnowledgeWriteResult {
                item,
                chunks_written: 0,
                unchanged: true,
            });
        }

        let record = KnowledgeItem {
            title,
            content,
            content_hash,
            updated_at: now,
            ..existing.clone()
        };
        self.write(record, Some(existing), now).await
    }

    async fn write(
        &self,
        mut item: KnowledgeItem,
        previous: Option<KnowledgeItem>,
        now: DateTime<Utc>,
    ) -> RagResult<KnowledgeWriteResult> {
        let texts = chunk_text(&item.content, &self.chunking);
        // Every embedding is computed before anything is written
        let lookups = self.cache.get_many_at(&texts, &self.model_id, now).await?;

        let chunks: Vec<KnowledgeChunk> = texts
            .into_iter()
            .enumerate()
            .map(|(idx, content)| KnowledgeChunk {
                vector_id: chunk_vector_id(&item.id, idx as u32),
                knowledge_item_id: item.id.clone(),
                chunk_index: idx as u32,
                content,
            })
            .collect();
        item.chunk_count = chunks.len() as u32;

        let mut written = Vec::with_capacity(chunks.len());
        for (chunk, lookup) in chunks.iter().zip(&lookups) {
            let metadata = DocumentMetadata::knowledge_chunk(&item.owner_id, &item.id, chunk.chunk_index, now);
            let upsert = self.index.upsert(&chunk.vector_id, &lookup.vector, metadata);
            if let Err(e) = timed(self.vector_timeout, "upsert", upsert).await {
                warn!("Failed to index chunk {}: {}", chunk.vector_id, e);
                if previous.is_none() {
                    self.remove_vectors(&written, "knowledge_create_aborted", now).await;
                }
                return Err(RagError::Storage(e));
            }
            written.push(chunk.vector_id.clone());
        }

        let saved = self.db.with_transaction(|tx| {
            KnowledgeItemStore::save_with_conn(tx, &item, &chunks)?;
            let cancelled = ReconciliationStore::cancel_with_conn(tx, &written)?;
            if cancelled > 0 {
                debug!("Cancelled {} queued deletions rewritten by {}", cancelled, item.id);
            }
            Ok(())
        });
        if let Err(e) = saved {
            warn!("Failed to save knowledge item {}: {}", item.id, e);
            if previous.is_none() {
                self.remove_vectors(&written, "knowledge_create_aborted", now).await;
            }
            return Err(RagError::Storage(e));
        }

        if let Some(previous) = &previous {
            let stale: Vec<String> = (item.chunk_count..previous.chunk_count)
                .map(|idx| chunk_vector_id(&item.id, idx))
                .collect();
            self.remove_vectors(&stale, "knowledge_chunks_shrunk", now).await;
        }

        info!(
            "Stored knowledge item {} for {} ({} chunks)",
            item.id, item.owner_id, item.chunk_count
        );
        Ok(KnowledgeWriteResult {
            chunks_written: written.len(),
            item,
            unchanged: false,
        })
    }

    async fn remove_vectors(&self, ids: &[String], reason: &str, now: DateTime<Utc>) -> Vec<String> {
        delete_or_reconcile(self.index.as_ref(), &self.db, ids, reason, now, self.vector_timeout).await
    }

    /// Remove the item. The relational delete succeeds even when the index is down.
    pub async fn delete(&self, id: &str) -> RagResult<KnowledgeDeleteResult> {
        let vector_ids = self
            .db
            .knowledge
            .delete_item(id)?
            .ok_or_else(|| RagError::not_found("knowledge item", id))?;
        let orphaned = self
            .remove_vectors(&vector_ids, "knowledge_item_deleted", self.clock.now())
            .await;
        info!("Deleted knowledge item {} ({} vectors)", id, vector_ids.len());
        Ok(KnowledgeDeleteResult {
            id: id.to_string(),
            vectors_deleted: vector_ids.len() - orphaned.len(),
            orphaned,
        })
    }

    pub fn get(&self, id: &str) -> RagResult<KnowledgeItem> {
        self.db
            .knowledge
            .get_item(id)?
            .ok_or_else(|| RagError::not_found("knowledge item", id))
    }

    pub fn list(&self, owner_id: &str) -> RagResult<Vec<KnowledgeItem>> {
        Ok(self.db.knowledge.list_items(owner_id)?)
    }

    /// Retry queued vector deletions
    pub async fn reconcile_orphans(&self, limit: usize) -> RagResult<ReconcileReport> {
        let tasks = self.db.reconciliation.pending(limit)?;
        if tasks.is_empty() {
            return Ok(ReconcileReport::default());
        }
        let task_ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        let vector_ids: Vec<String> = tasks.into_iter().map(|t| t.vector_id).collect();

        let resolved = match timed(self.vector_timeout, "delete", self.index.delete(&vector_ids)).await {
            Ok(()) => self.db.reconciliation.complete(&task_ids)?,
            Err(e) => {
                warn!("Reconciliation of {} vectors failed: {}", vector_ids.len(), e);
                self.db.reconciliation.record_attempt(&task_ids)?;
                0
            }
        };
        let remaining = self.db.reconciliation.pending_count()?;
        info!("Reconciled {} orphaned vectors, {} remaining", resolved, remaining);
        Ok(ReconcileReport {
            attempted: task_ids.len(),
            resolved,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_management::EmbeddingCacheConfig;
    use crate::knowledge::ChunkStrategy;
    use crate::providers::HashingEmbeddingProvider;
    use crate::utils::ManualClock;
    use crate::vector_index::{InMemoryVectorIndex, MetadataFilter, VectorMatch};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory index that can be switched off and counts upserts
    struct SwitchableIndex {
        inner: InMemoryVectorIndex,
        down: AtomicBool,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for SwitchableIndex {
        async fn upsert(&self, id: &str, vector: &[f32], metadata: DocumentMetadata) -> anyhow::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("index down");
            }
            self.upserts.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert(id, vector, metadata).await
        }

        async fn query(&self, vector: &[f32], top_k: usize, filter: &MetadataFilter) -> anyhow::Result<Vec<VectorMatch>> {
            self.inner.query(vector, top_k, filter).await
        }

        async fn delete(&self, ids: &[String]) -> anyhow::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("index down");
            }
            self.inner.delete(ids).await
        }

        async fn len(&self) -> anyhow::Result<usize> {
            self.inner.len().await
        }

        fn backend_name(&self) -> &'static str {
            "switchable"
        }
    }

    struct Fixture {
        store: KnowledgeStore,
        index: Arc<SwitchableIndex>,
        db: Arc<MemoryDatabase>,
    }

    fn fixture(chunk_size: usize, overlap: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let cache = Arc::new(
            EmbeddingCache::new(
                Arc::new(HashingEmbeddingProvider::new(64)),
                &EmbeddingCacheConfig::default(),
                clock.clone(),
            )
            .unwrap(),
        );
        let index = Arc::new(SwitchableIndex {
            inner: InMemoryVectorIndex::new(),
            down: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
        });
        let store = KnowledgeStore::new(
            db.clone(),
            cache,
            index.clone(),
            ChunkConfig {
                strategy: ChunkStrategy::FixedSize,
                chunk_size,
                overlap,
            },
            "hash-64",
            clock,
            Duration::from_secs(1),
        )
        .unwrap();
        Fixture { store, index, db }
    }

    fn new_item(id: &str, content: &str) -> NewKnowledgeItem {
        NewKnowledgeItem {
            id: Some(id.to_string()),
            owner_id: "u1".to_string(),
            title: Some("notes".to_string()),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_chunks_and_indexes() {
        let f = fixture(20, 5);
        let result = f
            .store
            .create(new_item("k1", "Paris is the capital of France and its largest city."))
            .await
            .unwrap();
        assert!(result.item.chunk_count > 1);
        assert_eq!(result.chunks_written, result.item.chunk_count as usize);
        assert_eq!(f.index.len().await.unwrap(), result.chunks_written);
        assert_eq!(f.db.knowledge.get_chunks("k1").unwrap().len(), result.chunks_written);
    }

    #[tokio::test]
    async fn test_empty_content_writes_no_vectors() {
        let f = fixture(20, 5);
        let result = f.store.create(new_item("k1", "   ")).await.unwrap();
        assert_eq!(result.item.chunk_count, 0);
        assert_eq!(f.index.upserts.load(Ordering::SeqCst), 0);
        assert!(f.store.get("k1").is_ok());
    }

    #[tokio::test]
    async fn test_short_content_is_one_chunk() {
        let f = fixture(200, 20);
        let result = f.store.create(new_item("k1", "Paris.")).await.unwrap();
        assert_eq!(result.item.chunk_count, 1);
    }

    #[tokio::test]
    async fn test_identical_update_is_a_no_op() {
        let f = fixture(20, 5);
        let content = "Paris is the capital of France.";
        f.store.create(new_item("k1", content)).await.unwrap();
        let upserts = f.index.upserts.load(Ordering::SeqCst);

        let result = f
            .store
            .update("k1", Some("notes".to_string()), content.to_string())
            .await
            .unwrap();
        assert!(result.unchanged);
        assert_eq!(f.index.upserts.load(Ordering::SeqCst), upserts);
    }

    #[tokio::test]
    async fn test_shrinking_update_removes_stale_vectors() {
        let f = fixture(10, 0);
        f.store
            .create(new_item("k1", "aaaaaaaaaabbbbbbbbbbcccccccccc"))
            .await
            .unwrap();
        assert_eq!(f.index.len().await.unwrap(), 3);

        let result = f.store.update("k1", None, "short".to_string()).await.unwrap();
        assert_eq!(result.item.chunk_count, 1);
        assert_eq!(f.index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_index_down_queues_orphans() {
        let f = fixture(10, 0);
        f.store.create(new_item("k1", "aaaaaaaaaabbbbbbbbbb")).await.unwrap();

        f.index.down.store(true, Ordering::SeqCst);
        let result = f.store.delete("k1").await.unwrap();
        assert_eq!(result.orphaned, vec!["k1#0".to_string(), "k1#1".to_string()]);
        assert!(matches!(f.store.get("k1"), Err(RagError::NotFound { .. })));
        assert_eq!(f.db.reconciliation.pending_count().unwrap(), 2);

        let report = f.store.reconcile_orphans(10).await.unwrap();
        assert_eq!(report.resolved, 0);

        f.index.down.store(false, Ordering::SeqCst);
        let report = f.store.reconcile_orphans(10).await.unwrap();
        assert_eq!(report.resolved, 2);
        assert_eq!(report.remaining, 0);
        assert_eq!(f.index.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recreated_item_keeps_vectors_through_reconciliation() {
        let f = fixture(10, 0);
        f.store.create(new_item("k1", "Paris")).await.unwrap();

        f.index.down.store(true, Ordering::SeqCst);
        f.store.delete("k1").await.unwrap();
        assert_eq!(f.db.reconciliation.pending_count().unwrap(), 1);

        f.index.down.store(false, Ordering::SeqCst);
        let result = f.store.create(new_item("k1", "Lyon")).await.unwrap();
        assert_eq!(result.item.chunk_count, 1);
        assert_eq!(f.db.reconciliation.pending_count().unwrap(), 0);

        let report = f.store.reconcile_orphans(10).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(f.index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_growing_update_cancels_queued_deletions() {
        let f = fixture(10, 0);
        f.store
            .create(new_item("k1", "aaaaaaaaaabbbbbbbbbb"))
            .await
            .unwrap();

        // left over from an earlier shrink whose delete did not reach the index
        f.db
            .reconciliation
            .enqueue(&["k1#2".to_string()], "knowledge_chunks_shrunk", Utc::now())
            .unwrap();

        f.store
            .update("k1", None, "aaaaaaaaaabbbbbbbbbbcccccccccc".to_string())
            .await
            .unwrap();
        assert_eq!(f.db.reconciliation.pending_count().unwrap(), 0);
        f.store.reconcile_orphans(10).await.unwrap();
        assert_eq!(f.index.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let f = fixture(10, 0);
        f.index.down.store(true, Ordering::SeqCst);
        let err = f.store.create(new_item("k1", "Paris")).await.unwrap_err();
        assert!(matches!(err, RagError::Storage(_)));
        assert!(f.db.knowledge.get_item("k1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation() {
        let f = fixture(10, 0);
        let mut item = new_item("k1", "Paris");
        item.owner_id = " ".to_string();
        assert!(matches!(f.store.create(item).await, Err(RagError::Validation(_))));

        f.store.create(new_item("k1", "Paris")).await.unwrap();
        assert!(matches!(
            f.store.create(new_item("k1", "Lyon")).await,
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            f.store.update("missing", None, "x".to_string()).await,
            Err(RagError::NotFound { .. })
        ));
    }
}
