//! Database schema definitions for the retrieval core
use anyhow::{anyhow, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stored timestamp format. Fixed-width RFC 3339 so lexical order is time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow!(concat!("unknown ", stringify!($name), " {:?}"), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    FunctionCall,
    Tool,
}

string_enum!(Role {
    System => "system",
    User => "user",
    Assistant => "assistant",
    FunctionCall => "function_call",
    Tool => "tool",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryTier {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

string_enum!(SummaryTier {
    ShortTerm => "short_term",
    MediumTerm => "medium_term",
    LongTerm => "long_term",
});

impl SummaryTier {
    /// Tier a compacted run of this tier is promoted into
    pub fn next(&self) -> Option<SummaryTier> {
        match self {
            Self::ShortTerm => Some(Self::MediumTerm),
            Self::MediumTerm => Some(Self::LongTerm),
            Self::LongTerm => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    UserQuery,
    ConversationHistory,
    Document,
}

string_enum!(EmbeddingSource {
    UserQuery => "user_query",
    ConversationHistory => "conversation_history",
    Document => "document",
});

/// Where a retrieved document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Knowledge,
    Memory,
}

string_enum!(RetrievalSource {
    Knowledge => "knowledge",
    Memory => "memory",
});

/// Kind of record a vector points back to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorKind {
    KnowledgeChunk,
    Summary,
}

impl VectorKind {
    pub fn source(&self) -> RetrievalSource {
        match self {
            Self::KnowledgeChunk => RetrievalSource::Knowledge,
            Self::Summary => RetrievalSource::Memory,
        }
    }
}

/// Metadata attached to every vector. Closed set of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentMetadata {
    pub kind: VectorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<SummaryTier>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentMetadata {
    pub fn knowledge_chunk(
        owner_id: &str,
        knowledge_item_id: &str,
        chunk_index: u32,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: VectorKind::KnowledgeChunk,
            owner_id: Some(owner_id.to_string()),
            knowledge_item_id: Some(knowledge_item_id.to_string()),
            chunk_index: Some(chunk_index),
            conversation_id: None,
            summary_id: None,
            tier: None,
            updated_at,
        }
    }

    pub fn summary(summary: &ConversationSummary) -> Self {
        Self {
            kind: VectorKind::Summary,
            owner_id: None,
            knowledge_item_id: None,
            chunk_index: None,
            conversation_id: Some(summary.conversation_id.clone()),
            summary_id: Some(summary.id.clone()),
            tier: Some(summary.tier),
            updated_at: summary.created_at,
        }
    }
}

/// Vector id of one knowledge chunk
pub fn chunk_vector_id(knowledge_item_id: &str, chunk_index: u32) -> String {
    format!("{knowledge_item_id}#{chunk_index}")
}

/// Vector id of one conversation summary
pub fn summary_vector_id(summary_id: &str) -> String {
    format!("summary:{summary_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub content: String,
    /// Hash over content, chunking parameters and embedding model
    pub content_hash: String,
    pub chunk_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub vector_id: String,
    pub knowledge_item_id: String,
    pub chunk_index: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_id: Option<String>,
    pub system_prompt_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_summarized_at: Option<DateTime<Utc>>,
    /// Sequence number of the last message folded into a short-term summary
    pub last_summarized_seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// 1-based position within the conversation
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub message_id: String,
    /// -1 or +1
    pub rating: i8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub tier: SummaryTier,
    pub start_message_id: String,
    pub end_message_id: String,
    pub start_seq: i64,
    pub end_seq: i64,
    pub embedding_ref: Option<String>,
    /// Set once this summary has been compacted into a higher tier
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 1 (lowest) to 10
    pub priority: u8,
    pub last_accessed: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

pub const MIN_SUMMARY_PRIORITY: u8 = 1;
pub const MAX_SUMMARY_PRIORITY: u8 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub text: String,
    /// Cache key of the vector; identical inputs share one record
    pub vector_id: String,
    pub model_id: String,
    pub source: EmbeddingSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagOperation {
    pub id: String,
    pub query: String,
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// "knowledge", "memory" or "hybrid"
    pub source: String,
    pub degraded: bool,
    pub operation_time_ms: u64,
    pub embedding_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub rag_operation_id: String,
    /// 0-based position in the ranked output
    pub rank: u32,
    pub document_id: String,
    pub similarity_score: f32,
    pub content: String,
    pub source: RetrievalSource,
    pub metadata: Option<DocumentMetadata>,
    pub used_in_context: bool,
    pub timestamp: DateTime<Utc>,
}

/// Vector deletions that failed and still need to be applied to the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationTask {
    pub id: i64,
    pub vector_id: String,
    pub reason: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_knowledge_items: i64,
    pub total_knowledge_chunks: i64,
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_summaries: i64,
    pub total_embeddings: i64,
    pub total_operations: i64,
    pub pending_reconciliation: i64,
    pub database_size_bytes: i64,
}
