//! Summary storage and retrieval operations
use crate::memory_db::schema::*;
use crate::memory_db::{get_conn, DbConnection, DbPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::{debug, info};

const SUMMARY_COLUMNS: &str = "id, conversation_id, content, tier, start_message_id, end_message_id, \
     start_seq, end_seq, embedding_ref, superseded_by, created_at, priority, last_accessed";

pub struct SummaryStore {
    pool: DbPool,
}

impl SummaryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<DbConnection> {
        get_conn(&self.pool)
    }

    pub fn insert_summary_with_conn(conn: &Connection, summary: &ConversationSummary) -> anyhow::Result<()> {
        debug!(
            "Storing {} summary for conversation {} (messages {} to {})",
            summary.tier, summary.conversation_id, summary.start_seq, summary.end_seq
        );
        conn.execute(
            "INSERT INTO conversation_summaries
             (id, conversation_id, content, tier, start_message_id, end_message_id,
              start_seq, end_seq, embedding_ref, superseded_by, created_at, priority, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &summary.id,
                &summary.conversation_id,
                &summary.content,
                summary.tier.as_str(),
                &summary.start_message_id,
                &summary.end_message_id,
                summary.start_seq,
                summary.end_seq,
                &summary.embedding_ref,
                &summary.superseded_by,
                format_timestamp(&summary.created_at),
                summary.priority,
                format_timestamp(&summary.last_accessed),
            ],
        )?;
        Ok(())
    }

    pub fn get_summary(&self, id: &str) -> anyhow::Result<Option<ConversationSummary>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM conversation_summaries WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_summary(row)?)),
            None => Ok(None),
        }
    }

    /// Summaries still eligible for retrieval, oldest range first
    pub fn get_active_summaries(
        &self,
        conversation_id: &str,
        tier: Option<SummaryTier>,
    ) -> anyhow::Result<Vec<ConversationSummary>> {
        let conn = self.get_conn()?;
        let mut sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM conversation_summaries
             WHERE conversation_id = ?1 AND superseded_by IS NULL"
        );
        let tier_text = tier.map(|t| t.as_str());
        if tier_text.is_some() {
            sql.push_str(" AND tier = ?2");
        }
        sql.push_str(" ORDER BY start_seq ASC, tier ASC");

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = match tier_text {
            Some(t) => stmt.query(params![conversation_id, t])?,
            None => stmt.query([conversation_id])?,
        };
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_summary(row)?);
        }
        Ok(summaries)
    }

    /// Every summary of a conversation, superseded ones included
    pub fn get_all_summaries(&self, conversation_id: &str) -> anyhow::Result<Vec<ConversationSummary>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM conversation_summaries
             WHERE conversation_id = ?1 ORDER BY start_seq ASC, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([conversation_id])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_summary(row)?);
        }
        Ok(summaries)
    }

    /// Mark `ids` as compacted into `superseded_by`.
    ///
    /// Returns the number of rows that were still active; callers treat a
    /// short count as a lost race and roll back.
    pub fn mark_superseded_with_conn(
        conn: &Connection,
        ids: &[String],
        superseded_by: &str,
    ) -> anyhow::Result<usize> {
        let mut updated = 0;
        for id in ids {
            updated += conn.execute(
                "UPDATE conversation_summaries SET superseded_by = ?1
                 WHERE id = ?2 AND superseded_by IS NULL",
                params![superseded_by, id],
            )?;
        }
        Ok(updated)
    }

    pub fn set_embedding_ref(&self, id: &str, vector_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE conversation_summaries SET embedding_ref = ?1 WHERE id = ?2",
            params![vector_id, id],
        )?;
        Ok(())
    }

    pub fn update_content(&self, id: &str, content: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE conversation_summaries SET content = ?1, embedding_ref = NULL WHERE id = ?2",
            params![content, id],
        )?;
        Ok(updated > 0)
    }

    pub fn set_priority(&self, id: &str, priority: u8) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE conversation_summaries SET priority = ?1 WHERE id = ?2",
            params![priority, id],
        )?;
        Ok(updated > 0)
    }

    /// Bump last-access time for summaries that were selected into a context
    pub fn touch(&self, ids: &[String], now: DateTime<Utc>) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE conversation_summaries SET last_accessed = ? WHERE id IN ({placeholders})"
        );
        let mut values = Vec::with_capacity(ids.len() + 1);
        values.push(format_timestamp(&now));
        values.extend(ids.iter().cloned());
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    pub fn delete_summaries(&self, ids: &[String]) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let mut deleted = 0;
        for id in ids {
            deleted += conn.execute("DELETE FROM conversation_summaries WHERE id = ?1", [id])?;
        }
        info!("Deleted {} summaries", deleted);
        Ok(deleted)
    }

    /// Active summaries that never got a vector, oldest first
    pub fn get_missing_embeddings(&self, limit: usize) -> anyhow::Result<Vec<ConversationSummary>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM conversation_summaries
             WHERE embedding_ref IS NULL AND superseded_by IS NULL
             ORDER BY created_at ASC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([limit as i64])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_summary(row)?);
        }
        Ok(summaries)
    }
}

fn row_to_summary(row: &Row<'_>) -> anyhow::Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
        tier: row.get::<_, String>(3)?.parse()?,
        start_message_id: row.get(4)?,
        end_message_id: row.get(5)?,
        start_seq: row.get(6)?,
        end_seq: row.get(7)?,
        embedding_ref: row.get(8)?,
        superseded_by: row.get(9)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?)?,
        priority: row.get(11)?,
        last_accessed: parse_timestamp(&row.get::<_, String>(12)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;
    use chrono::TimeZone;

    fn seed(db: &MemoryDatabase, tier: SummaryTier, start: i64, end: i64) -> ConversationSummary {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let conv_id = match db.conversations.get_conversation("c1").unwrap() {
            Some(c) => c.id,
            None => {
                db.with_transaction(|tx| {
                    tx.execute(
                        "INSERT INTO conversations (id, created_at, updated_at) VALUES ('c1', ?1, ?1)",
                        [format_timestamp(&now)],
                    )?;
                    Ok(())
                })
                .unwrap();
                "c1".to_string()
            }
        };
        let summary = ConversationSummary {
            id: format!("s{start}-{end}"),
            conversation_id: conv_id,
            content: format!("messages {start}..{end}"),
            tier,
            start_message_id: format!("m{start}"),
            end_message_id: format!("m{end}"),
            start_seq: start,
            end_seq: end,
            embedding_ref: None,
            superseded_by: None,
            created_at: now,
            priority: 1,
            last_accessed: now,
        };
        db.with_transaction(|tx| SummaryStore::insert_summary_with_conn(tx, &summary))
            .unwrap();
        summary
    }

    #[test]
    fn test_supersede_hides_from_active_set() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = seed(&db, SummaryTier::ShortTerm, 1, 10);
        let b = seed(&db, SummaryTier::ShortTerm, 11, 20);
        let merged = seed(&db, SummaryTier::MediumTerm, 1, 20);

        let ids = vec![a.id.clone(), b.id.clone()];
        let marked = db
            .with_transaction(|tx| SummaryStore::mark_superseded_with_conn(tx, &ids, &merged.id))
            .unwrap();
        assert_eq!(marked, 2);

        let active = db.summaries.get_active_summaries("c1", None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, merged.id);
        assert_eq!(db.summaries.get_all_summaries("c1").unwrap().len(), 3);

        // A second compaction of the same run changes nothing
        let again = db
            .with_transaction(|tx| SummaryStore::mark_superseded_with_conn(tx, &ids, "other"))
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_priority_is_bounded_by_schema() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let s = seed(&db, SummaryTier::ShortTerm, 1, 10);
        assert!(db.summaries.set_priority(&s.id, 7).unwrap());
        assert!(db.summaries.set_priority(&s.id, 11).is_err());
        assert_eq!(db.summaries.get_summary(&s.id).unwrap().unwrap().priority, 7);
    }

    #[test]
    fn test_touch_and_missing_embeddings() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let s = seed(&db, SummaryTier::ShortTerm, 1, 10);
        assert_eq!(db.summaries.get_missing_embeddings(10).unwrap().len(), 1);
        db.summaries.set_embedding_ref(&s.id, "summary:x").unwrap();
        assert!(db.summaries.get_missing_embeddings(10).unwrap().is_empty());

        let later = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(db.summaries.touch(&[s.id.clone()], later).unwrap(), 1);
        assert_eq!(db.summaries.get_summary(&s.id).unwrap().unwrap().last_accessed, later);
    }
}
