//! Embedding cache: normalized text + model id to vector, with single-flight misses

pub mod cache_config;
pub mod embedding_cache;

pub use cache_config::EmbeddingCacheConfig;
pub use embedding_cache::{EmbeddingCache, EmbeddingCacheStats, EmbeddingLookup};
