//! User-owned knowledge: chunking and the vector-synchronized item store
pub mod chunking;
pub mod knowledge_store;

pub use chunking::{chunk_text, ChunkConfig, ChunkStrategy};
pub use knowledge_store::{
    KnowledgeDeleteResult, KnowledgeStore, KnowledgeWriteResult, NewKnowledgeItem, ReconcileReport,
};
