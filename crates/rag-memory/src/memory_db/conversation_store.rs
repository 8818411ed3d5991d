//! Conversations, their ordered messages and per-message feedback
use crate::memory_db::schema::*;
use crate::memory_db::{get_conn, DbConnection, DbPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, owner_id, system_prompt_id, created_at, updated_at, \
     last_summarized_at, last_summarized_seq";
const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, role, content, created_at";

pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<DbConnection> {
        get_conn(&self.pool)
    }

    pub fn create_conversation(
        &self,
        owner_id: Option<&str>,
        system_prompt_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.map(str::to_string),
            system_prompt_id: system_prompt_id.map(str::to_string),
            created_at: now,
            updated_at: now,
            last_summarized_at: None,
            last_summarized_seq: 0,
        };
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversations
             (id, owner_id, system_prompt_id, created_at, updated_at, last_summarized_at, last_summarized_seq)
             VALUES (?1, ?2, ?3, ?4, ?4, NULL, 0)",
            params![
                &conversation.id,
                &conversation.owner_id,
                &conversation.system_prompt_id,
                format_timestamp(&now),
            ],
        )?;
        debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let conn = self.get_conn()?;
        Self::get_conversation_with_conn(&conn, id)
    }

    pub fn get_conversation_with_conn(
        conn: &Connection,
        id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    /// Delete a conversation; messages, summaries and feedback cascade
    pub fn delete_conversation(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        Ok(conn.execute("DELETE FROM conversations WHERE id = ?1", [id])? > 0)
    }

    /// Append a message with the next sequence number.
    ///
    /// Returns `None` when the conversation does not exist.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Message>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let touched = tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![format_timestamp(&now), conversation_id],
        )?;
        if touched == 0 {
            return Ok(None);
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            created_at: now,
        };
        tx.execute(
            "INSERT INTO messages (id, conversation_id, seq, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &message.id,
                &message.conversation_id,
                message.seq,
                message.role.as_str(),
                &message.content,
                format_timestamp(&now),
            ],
        )?;
        tx.commit()?;

        Ok(Some(message))
    }

    pub fn get_message(&self, id: &str) -> anyhow::Result<Option<Message>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_message(row)?)),
            None => Ok(None),
        }
    }

    /// Messages with `seq > after_seq`, in order, at most `limit` of them
    pub fn get_messages_after(
        &self,
        conversation_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![conversation_id, after_seq, limit as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub fn get_all_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        self.get_messages_after(conversation_id, 0, i64::MAX as usize)
    }

    /// The last `count` messages with `seq > after_seq`, oldest first
    pub fn get_latest_messages(
        &self,
        conversation_id: &str,
        after_seq: i64,
        count: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![conversation_id, after_seq, count as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Move the summarization cursor only if it still sits at `expected_seq`
    pub fn advance_summary_cursor_with_conn(
        conn: &Connection,
        conversation_id: &str,
        expected_seq: i64,
        new_seq: i64,
        summarized_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let updated = conn.execute(
            "UPDATE conversations
             SET last_summarized_seq = ?1, last_summarized_at = ?2
             WHERE id = ?3 AND last_summarized_seq = ?4",
            params![new_seq, format_timestamp(&summarized_at), conversation_id, expected_seq],
        )?;
        Ok(updated == 1)
    }

    /// Record a rating for a message. A message carries at most one.
    pub fn record_feedback(
        &self,
        message_id: &str,
        rating: i8,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Feedback> {
        let feedback = Feedback {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            rating,
            comment: comment.map(str::to_string),
            created_at: now,
        };
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO feedback (id, message_id, rating, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &feedback.id,
                &feedback.message_id,
                feedback.rating,
                &feedback.comment,
                format_timestamp(&now),
            ],
        )?;
        Ok(feedback)
    }

    pub fn get_feedback(&self, message_id: &str) -> anyhow::Result<Option<Feedback>> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                "SELECT id, message_id, rating, comment, created_at FROM feedback WHERE message_id = ?1",
                [message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i8>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(id, message_id, rating, comment, created_at)| {
            Ok(Feedback {
                id,
                message_id,
                rating,
                comment,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }
}

fn row_to_conversation(row: &Row<'_>) -> anyhow::Result<Conversation> {
    let last_summarized_at: Option<String> = row.get(5)?;
    Ok(Conversation {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        system_prompt_id: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(4)?)?,
        last_summarized_at: last_summarized_at.as_deref().map(parse_timestamp).transpose()?,
        last_summarized_seq: row.get(6)?,
    })
}

pub(crate) fn row_to_message(row: &Row<'_>) -> anyhow::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: row.get::<_, String>(3)?.parse()?,
        content: row.get(4)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}
