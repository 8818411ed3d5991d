//! Persistent vector index stored next to the relational data
//!
//! Vectors are bincode blobs in `vector_entries`. Queries narrow the scan by
//! kind/owner/conversation in SQL, then score the remaining rows linearly.
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, ToSql};
use tracing::debug;

use super::{compare_matches, cosine_similarity, validate_vector, MetadataFilter, VectorIndex, VectorMatch};
use crate::memory_db::{get_conn, DbPool, DocumentMetadata, VectorKind};

pub struct SqliteVectorIndex {
    pool: DbPool,
}

fn kind_text(kind: VectorKind) -> &'static str {
    match kind {
        VectorKind::KnowledgeChunk => "knowledge_chunk",
        VectorKind::Summary => "summary",
    }
}

impl SqliteVectorIndex {
    /// Uses the `vector_entries` table created by the database migrations
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(DbPool) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = DbPool::clone(&self.pool);
        tokio::task::spawn_blocking(move || f(pool))
            .await
            .map_err(|e| anyhow::anyhow!("vector index task failed: {}", e))?
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: DocumentMetadata) -> anyhow::Result<()> {
        validate_vector(vector)?;
        let id = id.to_string();
        let blob = bincode::serialize(vector)?;
        let dimensions = vector.len() as i64;
        self.blocking(move |pool| {
            let conn = get_conn(&pool)?;
            conn.execute(
                "INSERT OR REPLACE INTO vector_entries
                 (id, kind, owner_id, conversation_id, dimensions, vector, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    kind_text(metadata.kind),
                    &metadata.owner_id,
                    &metadata.conversation_id,
                    dimensions,
                    blob,
                    serde_json::to_string(&metadata)?,
                ],
            )?;
            Ok(())
        })
        .await
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
        let query = vector.to_vec();
        let filter = filter.clone();
        self.blocking(move |pool| {
            let conn = get_conn(&pool)?;
            let mut sql = "SELECT id, vector, metadata FROM vector_entries WHERE dimensions = ?".to_string();
            let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(query.len() as i64)];
            if let Some(kind) = filter.kind {
                sql.push_str(" AND kind = ?");
                values.push(Box::new(kind_text(kind)));
            }
            if let Some(owner) = &filter.owner_id {
                sql.push_str(" AND owner_id = ?");
                values.push(Box::new(owner.clone()));
            }
            if let Some(conversation) = &filter.conversation_id {
                sql.push_str(" AND conversation_id = ?");
                values.push(Box::new(conversation.clone()));
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut matches = Vec::new();
            while let Some(row) = rows.next()? {
                let metadata: DocumentMetadata = serde_json::from_str(&row.get::<_, String>(2)?)?;
                if !filter.matches(&metadata) {
                    continue;
                }
                let blob: Vec<u8> = row.get(1)?;
                let stored: Vec<f32> = bincode::deserialize(&blob)
                    .map_err(|e| anyhow::anyhow!("Bincode error: {}", e))?;
                matches.push(VectorMatch {
                    id: row.get(0)?,
                    score: cosine_similarity(&query, &stored),
                    metadata,
                });
            }
            matches.sort_by(compare_matches);
            matches.truncate(top_k);
            Ok(matches)
        })
        .await
    }

    async fn delete(&self, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.blocking(move |pool| {
            let conn = get_conn(&pool)?;
            let placeholders = vec!["?"; ids.len()].join(", ");
            let deleted = conn.execute(
                &format!("DELETE FROM vector_entries WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?;
            debug!("Deleted {} vectors", deleted);
            Ok(())
        })
        .await
    }

    async fn len(&self) -> anyhow::Result<usize> {
        self.blocking(|pool| {
            let conn = get_conn(&pool)?;
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM vector_entries", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
