//! Queue of vector deletions that did not reach the index
use crate::memory_db::schema::*;
use crate::memory_db::{get_conn, DbConnection, DbPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

pub struct ReconciliationStore {
    pool: DbPool,
}

impl ReconciliationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<DbConnection> {
        get_conn(&self.pool)
    }

    /// Queue vector ids for deletion. Ids already queued are left as they are.
    pub fn enqueue(&self, vector_ids: &[String], reason: &str, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO vector_reconciliation (vector_id, reason, attempts, created_at)
             VALUES (?1, ?2, 0, ?3)",
        )?;
        let mut queued = 0;
        for id in vector_ids {
            queued += stmt.execute(params![id, reason, format_timestamp(&now)])?;
        }
        Ok(queued)
    }

    /// Drop queued deletions for ids that were written again.
    /// Runs inside the transaction that makes those ids live.
    pub fn cancel_with_conn(conn: &Connection, vector_ids: &[String]) -> anyhow::Result<usize> {
        let mut stmt = conn.prepare("DELETE FROM vector_reconciliation WHERE vector_id = ?1")?;
        let mut cancelled = 0;
        for id in vector_ids {
            cancelled += stmt.execute([id])?;
        }
        Ok(cancelled)
    }

    pub fn pending(&self, limit: usize) -> anyhow::Result<Vec<ReconciliationTask>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, vector_id, reason, attempts, created_at FROM vector_reconciliation
             ORDER BY id ASC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(ReconciliationTask {
                id: row.get(0)?,
                vector_id: row.get(1)?,
                reason: row.get(2)?,
                attempts: row.get(3)?,
                created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
            });
        }
        Ok(tasks)
    }

    pub fn complete(&self, task_ids: &[i64]) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let mut done = 0;
        for id in task_ids {
            done += conn.execute("DELETE FROM vector_reconciliation WHERE id = ?1", [id])?;
        }
        Ok(done)
    }

    pub fn record_attempt(&self, task_ids: &[i64]) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        for id in task_ids {
            conn.execute(
                "UPDATE vector_reconciliation SET attempts = attempts + 1 WHERE id = ?1",
                [id],
            )?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM vector_reconciliation", [], |row| row.get(0))?)
    }
}
