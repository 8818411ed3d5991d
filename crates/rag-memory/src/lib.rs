//! Retrieval-augmented memory for conversational assistants
//!
//! Knowledge items are chunked and embedded into a vector index, long
//! conversations are folded into tiered summaries, and every retrieval is
//! recorded for later analysis.

pub mod cache_management;
pub mod config;
pub mod context_engine;
pub mod engine;
pub mod error;
pub mod knowledge;
pub mod memory_db;
pub mod metrics;
pub mod providers;
pub mod telemetry;
pub mod tracking;
pub mod utils;
pub mod vector_index;

// Public API exports
pub use config::Config;
pub use engine::RagEngine;
pub use error::{RagError, RagResult};

pub use cache_management::{EmbeddingCache, EmbeddingCacheConfig};
pub use context_engine::{
    Answer, AnswerRequest, AnswerStream, CompletionOrchestrator, MemoryManager, RankedContext, RankedItem,
    RetrievalFilters, RetrievalRequest, Retriever,
};
pub use knowledge::{KnowledgeStore, NewKnowledgeItem};
pub use memory_db::{MemoryDatabase, Message, Role, SummaryTier};
pub use tracking::{OperationMetrics, OperationTracker};
