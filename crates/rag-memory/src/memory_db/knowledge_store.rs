//! Knowledge items and the chunk text behind each of their vectors
use crate::memory_db::schema::*;
use crate::memory_db::{get_conn, DbConnection, DbPool};
use rusqlite::{params, Connection, Row};

const ITEM_COLUMNS: &str =
    "id, owner_id, title, content, content_hash, chunk_count, created_at, updated_at";

pub struct KnowledgeItemStore {
    pool: DbPool,
}

impl KnowledgeItemStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<DbConnection> {
        get_conn(&self.pool)
    }

    /// Insert or overwrite an item together with its full chunk set
    pub fn save_with_conn(
        conn: &Connection,
        item: &KnowledgeItem,
        chunks: &[KnowledgeChunk],
    ) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO knowledge_items
             (id, owner_id, title, content, content_hash, chunk_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at",
            params![
                &item.id,
                &item.owner_id,
                &item.title,
                &item.content,
                &item.content_hash,
                item.chunk_count,
                format_timestamp(&item.created_at),
                format_timestamp(&item.updated_at),
            ],
        )?;

        conn.execute(
            "DELETE FROM knowledge_chunks WHERE knowledge_item_id = ?1",
            [&item.id],
        )?;
        let mut stmt = conn.prepare(
            "INSERT INTO knowledge_chunks (vector_id, knowledge_item_id, chunk_index, content)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for chunk in chunks {
            stmt.execute(params![
                &chunk.vector_id,
                &chunk.knowledge_item_id,
                chunk.chunk_index,
                &chunk.content,
            ])?;
        }
        Ok(())
    }

    pub fn update_title(&self, id: &str, title: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE knowledge_items SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, format_timestamp(&now), id],
        )?;
        Ok(updated > 0)
    }

    pub fn get_item(&self, id: &str) -> anyhow::Result<Option<KnowledgeItem>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {ITEM_COLUMNS} FROM knowledge_items WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_item(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_items(&self, owner_id: &str) -> anyhow::Result<Vec<KnowledgeItem>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM knowledge_items WHERE owner_id = ?1 ORDER BY updated_at DESC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([owner_id])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(row_to_item(row)?);
        }
        Ok(items)
    }

    pub fn get_chunks(&self, knowledge_item_id: &str) -> anyhow::Result<Vec<KnowledgeChunk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT vector_id, knowledge_item_id, chunk_index, content FROM knowledge_chunks
             WHERE knowledge_item_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let mut rows = stmt.query([knowledge_item_id])?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            chunks.push(row_to_chunk(row)?);
        }
        Ok(chunks)
    }

    /// Chunk behind a vector id, with the owning item's owner and update time
    pub fn resolve_chunk(
        &self,
        vector_id: &str,
    ) -> anyhow::Result<Option<(KnowledgeChunk, String, chrono::DateTime<chrono::Utc>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.vector_id, c.knowledge_item_id, c.chunk_index, c.content, i.owner_id, i.updated_at
             FROM knowledge_chunks c JOIN knowledge_items i ON i.id = c.knowledge_item_id
             WHERE c.vector_id = ?1",
        )?;
        let mut rows = stmt.query([vector_id])?;
        match rows.next()? {
            Some(row) => {
                let chunk = row_to_chunk(row)?;
                let owner: String = row.get(4)?;
                let updated_at = parse_timestamp(&row.get::<_, String>(5)?)?;
                Ok(Some((chunk, owner, updated_at)))
            }
            None => Ok(None),
        }
    }

    /// Delete an item and its chunks, returning the vector ids that pointed at them
    pub fn delete_item(&self, id: &str) -> anyhow::Result<Option<Vec<String>>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let vector_ids = {
            let mut stmt = tx.prepare(
                "SELECT vector_id FROM knowledge_chunks WHERE knowledge_item_id = ?1 ORDER BY chunk_index",
            )?;
            let ids = stmt
                .query_map([id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        let deleted = tx.execute("DELETE FROM knowledge_items WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok((deleted > 0).then_some(vector_ids))
    }
}

fn row_to_item(row: &Row<'_>) -> anyhow::Result<KnowledgeItem> {
    Ok(KnowledgeItem {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        content_hash: row.get(4)?,
        chunk_count: row.get(5)?,
        created_at: parse_timestamp(&row.get::<_, String>(6)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(7)?)?,
    })
}

fn row_to_chunk(row: &Row<'_>) -> anyhow::Result<KnowledgeChunk> {
    Ok(KnowledgeChunk {
        vector_id: row.get(0)?,
        knowledge_item_id: row.get(1)?,
        chunk_index: row.get(2)?,
        content: row.get(3)?,
    })
}
