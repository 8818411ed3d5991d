//! Content-addressed embedding cache
//!
//! Keys are `blake3(model_id, normalized_text)`. Concurrent misses on one key
//! share a single provider call; failed computations are never cached, so
//! the next lookup retries. Freshness is checked against the caller's clock.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use moka::future::Cache;
use moka::ops::compute::Op;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::cache_config::EmbeddingCacheConfig;
use crate::error::{RagError, RagResult};
use crate::metrics;
use crate::providers::EmbeddingProvider;
use crate::utils::{Clock, TextUtils};

/// Parallel provider calls used by `get_many_at`
const BATCH_CONCURRENCY: usize = 4;

#[derive(Clone)]
struct CachedVector {
    vector: Arc<Vec<f32>>,
    cached_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    provider_calls: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingLookup {
    pub key: String,
    pub normalized_text: String,
    pub vector: Arc<Vec<f32>>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub provider_calls: u64,
    pub entries: u64,
}

pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Cache<String, CachedVector>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    counters: Arc<CacheCounters>,
}

impl EmbeddingCache {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl())
            .build();
        Ok(Self {
            provider,
            cache,
            ttl: chrono::Duration::seconds(config.ttl_seconds as i64),
            clock,
            counters: Arc::new(CacheCounters::default()),
        })
    }

    pub fn cache_key(normalized_text: &str, model_id: &str) -> String {
        TextUtils::content_hash(&[model_id, normalized_text])
    }

    pub async fn get(&self, text: &str, model_id: &str) -> RagResult<EmbeddingLookup> {
        self.get_at(text, model_id, self.clock.now()).await
    }

    /// Vector for `text` under `model_id`, computing it at most once per key
    pub async fn get_at(&self, text: &str, model_id: &str, now: DateTime<Utc>) -> RagResult<EmbeddingLookup> {
        let normalized = TextUtils::normalize_for_embedding(text);
        if normalized.is_empty() {
            return Err(RagError::validation("cannot embed empty text"));
        }
        if model_id.trim().is_empty() {
            return Err(RagError::validation("embedding model id must not be empty"));
        }
        let key = Self::cache_key(&normalized, model_id);

        if let Some(cached) = self.cache.get(&key).await {
            if now.signed_duration_since(cached.cached_at) < self.ttl {
                self.record_lookup(true);
                return Ok(EmbeddingLookup {
                    key,
                    normalized_text: normalized,
                    vector: cached.vector,
                    cache_hit: true,
                });
            }
            debug!("Embedding cache entry {} expired", key);
            // Another caller may already have refreshed it; only drop a stale value
            let ttl = self.ttl;
            self.cache
                .entry(key.clone())
                .and_compute_with(|current| {
                    let stale = current.is_some_and(|e| now.signed_duration_since(e.value().cached_at) >= ttl);
                    async move {
                        if stale {
                            Op::Remove
                        } else {
                            Op::Nop
                        }
                    }
                })
                .await;
        }

        let provider = Arc::clone(&self.provider);
        let counters = Arc::clone(&self.counters);
        let input = normalized.clone();
        let model = model_id.to_string();
        let init = async move {
            counters.provider_calls.fetch_add(1, Ordering::Relaxed);
            let vector = provider.embed(&input, &model).await?;
            if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
                anyhow::bail!("provider returned an unusable vector (len {})", vector.len());
            }
            Ok::<_, anyhow::Error>(CachedVector {
                vector: Arc::new(vector),
                cached_at: now,
            })
        };

        let entry = self
            .cache
            .entry(key.clone())
            .or_try_insert_with(init)
            .await
            .map_err(|e: Arc<anyhow::Error>| {
                warn!("Embedding computation failed: {}", e);
                RagError::provider("embedding", e)
            })?;

        // Waiters that joined another caller's computation count as hits
        let cache_hit = !entry.is_fresh();
        self.record_lookup(cache_hit);
        Ok(EmbeddingLookup {
            key,
            normalized_text: normalized,
            vector: entry.into_value().vector,
            cache_hit,
        })
    }

    /// Lookups for several texts, in input order; fails on the first error
    pub async fn get_many_at(
        &self,
        texts: &[String],
        model_id: &str,
        now: DateTime<Utc>,
    ) -> RagResult<Vec<EmbeddingLookup>> {
        stream::iter(texts.iter())
            .map(|text| self.get_at(text, model_id, now))
            .buffered(BATCH_CONCURRENCY)
            .try_collect()
            .await
    }

    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    pub async fn stats(&self) -> EmbeddingCacheStats {
        self.cache.run_pending_tasks().await;
        EmbeddingCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            provider_calls: self.counters.provider_calls.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.counters.hits } else { &self.counters.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_lookup(hit);
    }
}
