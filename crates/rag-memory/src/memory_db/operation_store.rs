//! Retrieval audit trail: query embeddings, operations and retrieved documents
use crate::memory_db::schema::*;
use crate::memory_db::{get_conn, DbConnection, DbPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};

const OPERATION_COLUMNS: &str = "o.id, o.query, o.message_id, o.conversation_id, o.user_id, \
     o.timestamp, o.source, o.degraded, o.operation_time_ms, o.embedding_id";

/// Half-open interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub source: Option<String>,
    pub degraded: Option<bool>,
}

impl OperationFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// WHERE clause over alias `o` plus its bound values
    fn where_clause(&self, range: &TimeRange) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses = vec!["o.timestamp >= ?".to_string(), "o.timestamp < ?".to_string()];
        let mut values: Vec<Box<dyn ToSql>> = vec![
            Box::new(format_timestamp(&range.start)),
            Box::new(format_timestamp(&range.end)),
        ];
        if let Some(user_id) = &self.user_id {
            clauses.push("o.user_id = ?".to_string());
            values.push(Box::new(user_id.clone()));
        }
        if let Some(conversation_id) = &self.conversation_id {
            clauses.push("o.conversation_id = ?".to_string());
            values.push(Box::new(conversation_id.clone()));
        }
        if let Some(source) = &self.source {
            clauses.push("o.source = ?".to_string());
            values.push(Box::new(source.clone()));
        }
        if let Some(degraded) = self.degraded {
            clauses.push("o.degraded = ?".to_string());
            values.push(Box::new(degraded));
        }
        (clauses.join(" AND "), values)
    }
}

/// Raw per-range numbers the tracker turns into metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationRollup {
    /// Sorted ascending
    pub latencies_ms: Vec<u64>,
    pub degraded_count: u64,
    pub document_count: u64,
    pub avg_similarity: Option<f64>,
    pub avg_used_similarity: Option<f64>,
    pub feedback_count: u64,
    pub avg_feedback: Option<f64>,
}

pub struct OperationStore {
    pool: DbPool,
}

impl OperationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<DbConnection> {
        get_conn(&self.pool)
    }

    /// Return the embedding record for `vector_id`, creating it on first use
    pub fn get_or_create_embedding_with_conn(
        conn: &Connection,
        text: &str,
        vector_id: &str,
        model_id: &str,
        source: EmbeddingSource,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EmbeddingRecord> {
        conn.execute(
            "INSERT OR IGNORE INTO embeddings (text, vector_id, model_id, source, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![text, vector_id, model_id, source.as_str(), format_timestamp(&now)],
        )?;
        let mut stmt = conn.prepare(
            "SELECT id, text, vector_id, model_id, source, timestamp FROM embeddings WHERE vector_id = ?1",
        )?;
        let mut rows = stmt.query([vector_id])?;
        match rows.next()? {
            Some(row) => row_to_embedding(row),
            None => anyhow::bail!("embedding {vector_id} vanished after insert"),
        }
    }

    pub fn get_embedding(&self, vector_id: &str) -> anyhow::Result<Option<EmbeddingRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, text, vector_id, model_id, source, timestamp FROM embeddings WHERE vector_id = ?1",
        )?;
        let mut rows = stmt.query([vector_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_embedding(row)?)),
            None => Ok(None),
        }
    }

    pub fn insert_operation_with_conn(
        conn: &Connection,
        operation: &RagOperation,
        documents: &[RetrievedDocument],
    ) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO rag_operations
             (id, query, message_id, conversation_id, user_id, timestamp, source, degraded,
              operation_time_ms, embedding_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &operation.id,
                &operation.query,
                &operation.message_id,
                &operation.conversation_id,
                &operation.user_id,
                format_timestamp(&operation.timestamp),
                &operation.source,
                operation.degraded,
                operation.operation_time_ms as i64,
                operation.embedding_id,
            ],
        )?;

        let mut stmt = conn.prepare(
            "INSERT INTO retrieved_documents
             (id, rag_operation_id, rank, document_id, similarity_score, content, source,
              metadata, used_in_context, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for doc in documents {
            let metadata = doc.metadata.as_ref().map(serde_json::to_string).transpose()?;
            stmt.execute(params![
                &doc.id,
                &doc.rag_operation_id,
                doc.rank,
                &doc.document_id,
                doc.similarity_score as f64,
                &doc.content,
                doc.source.as_str(),
                metadata,
                doc.used_in_context,
                format_timestamp(&doc.timestamp),
            ])?;
        }
        Ok(())
    }

    pub fn get_operation(&self, id: &str) -> anyhow::Result<Option<RagOperation>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM rag_operations o WHERE o.id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_operation(row)?)),
            None => Ok(None),
        }
    }

    /// Documents of one operation in ranked order
    pub fn get_documents(&self, operation_id: &str) -> anyhow::Result<Vec<RetrievedDocument>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, rag_operation_id, rank, document_id, similarity_score, content, source,
                    metadata, used_in_context, timestamp
             FROM retrieved_documents WHERE rag_operation_id = ?1 ORDER BY rank ASC",
        )?;
        let mut rows = stmt.query([operation_id])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let metadata: Option<String> = row.get(7)?;
            documents.push(RetrievedDocument {
                id: row.get(0)?,
                rag_operation_id: row.get(1)?,
                rank: row.get(2)?,
                document_id: row.get(3)?,
                similarity_score: row.get::<_, f64>(4)? as f32,
                content: row.get(5)?,
                source: row.get::<_, String>(6)?.parse()?,
                metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
                used_in_context: row.get(8)?,
                timestamp: parse_timestamp(&row.get::<_, String>(9)?)?,
            });
        }
        Ok(documents)
    }

    pub fn list_operations(
        &self,
        filter: &OperationFilter,
        range: &TimeRange,
    ) -> anyhow::Result<Vec<RagOperation>> {
        let conn = self.get_conn()?;
        let (where_sql, values) = filter.where_clause(range);
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM rag_operations o WHERE {where_sql}
             ORDER BY o.timestamp ASC, o.id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut rows = stmt.query(params.as_slice())?;
        let mut operations = Vec::new();
        while let Some(row) = rows.next()? {
            operations.push(row_to_operation(row)?);
        }
        Ok(operations)
    }

    /// Raw aggregates over the operations matching `filter` in `range`.
    ///
    /// Feedback is attributed to an operation when it rates the message that
    /// directly follows the operation's query message (the answer to it).
    pub fn rollup(&self, filter: &OperationFilter, range: &TimeRange) -> anyhow::Result<OperationRollup> {
        let conn = self.get_conn()?;
        let (where_sql, values) = filter.where_clause(range);
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let mut stmt = conn.prepare(&format!(
            "SELECT o.operation_time_ms, o.degraded FROM rag_operations o WHERE {where_sql}
             ORDER BY o.operation_time_ms ASC"
        ))?;
        let mut rows = stmt.query(params.as_slice())?;
        let mut rollup = OperationRollup::default();
        while let Some(row) = rows.next()? {
            rollup.latencies_ms.push(row.get::<_, i64>(0)?.max(0) as u64);
            if row.get::<_, bool>(1)? {
                rollup.degraded_count += 1;
            }
        }

        let (document_count, avg_similarity, avg_used_similarity) = conn.query_row(
            &format!(
                "SELECT COUNT(d.id), AVG(d.similarity_score),
                        AVG(CASE WHEN d.used_in_context = 1 THEN d.similarity_score END)
                 FROM retrieved_documents d JOIN rag_operations o ON o.id = d.rag_operation_id
                 WHERE {where_sql}"
            ),
            params.as_slice(),
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            },
        )?;
        rollup.document_count = document_count.max(0) as u64;
        rollup.avg_similarity = avg_similarity;
        rollup.avg_used_similarity = avg_used_similarity;

        let (feedback_count, avg_feedback) = conn.query_row(
            &format!(
                "SELECT COUNT(f.id), AVG(f.rating)
                 FROM rag_operations o
                 JOIN messages q ON q.id = o.message_id
                 JOIN messages a ON a.conversation_id = q.conversation_id AND a.seq = q.seq + 1
                 JOIN feedback f ON f.message_id = a.id
                 WHERE {where_sql}"
            ),
            params.as_slice(),
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?)),
        )?;
        rollup.feedback_count = feedback_count.max(0) as u64;
        rollup.avg_feedback = avg_feedback;

        Ok(rollup)
    }
}

fn row_to_embedding(row: &Row<'_>) -> anyhow::Result<EmbeddingRecord> {
    Ok(EmbeddingRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        vector_id: row.get(2)?,
        model_id: row.get(3)?,
        source: row.get::<_, String>(4)?.parse()?,
        timestamp: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_operation(row: &Row<'_>) -> anyhow::Result<RagOperation> {
    Ok(RagOperation {
        id: row.get(0)?,
        query: row.get(1)?,
        message_id: row.get(2)?,
        conversation_id: row.get(3)?,
        user_id: row.get(4)?,
        timestamp: parse_timestamp(&row.get::<_, String>(5)?)?,
        source: row.get(6)?,
        degraded: row.get(7)?,
        operation_time_ms: row.get::<_, i64>(8)?.max(0) as u64,
        embedding_id: row.get(9)?,
    })
}
