use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCacheConfig {
    /// Upper bound on cached vectors; least recently used entries go first
    pub max_entries: u64,

    /// Entries older than this are recomputed on the next lookup
    pub ttl_seconds: u64,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_seconds: 24 * 60 * 60,
        }
    }
}

impl EmbeddingCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_entries == 0 {
            anyhow::bail!("embedding cache max_entries must be greater than zero");
        }
        if self.ttl_seconds == 0 {
            anyhow::bail!("embedding cache ttl_seconds must be greater than zero");
        }
        Ok(())
    }
}
