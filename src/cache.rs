// Copyright 2025 Gauntlet Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Caching layer for execution results.
//!
//! The cache is checked before every adapter invocation; a hit skips the call
//! entirely. Access is read-then-write without a lock, so two identical specs
//! racing through the pool may both compute; the second write wins and the
//! duplicate work is accepted as non-fatal.

use crate::types::Dimension;
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Key for one execution result.
///
/// Keys carry no run-scoped or process-wide namespace: unrelated concurrent
/// runs sharing one cache store can collide on identical
/// (owner, dimension, input). Callers that need isolation must use separate
/// cache instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    owner: String,
    dimension: String,
    input: String,
    run_index: Option<usize>,
}

impl CacheKey {
    pub fn new(
        owner: &str,
        dimension: &Dimension,
        input: &serde_json::Value,
        run_index: Option<usize>,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            dimension: dimension.as_str().to_string(),
            input: input.to_string(),
            run_index,
        }
    }
}

/// Cached output of one adapter call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedExecution {
    pub output: serde_json::Value,
}

/// Narrow cache contract consumed by the execution scheduler.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<CachedExecution>;
    async fn set(&self, key: CacheKey, value: CachedExecution);
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}

/// Default moka-backed cache with hit/miss counters.
pub struct MokaResultCache {
    cache: Cache<CacheKey, CachedExecution>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MokaResultCache {
    /// Create a cache with the given TTL in seconds.
    pub fn new(ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
        }
    }
}

#[async_trait]
impl ResultCache for MokaResultCache {
    async fn get(&self, key: &CacheKey) -> Option<CachedExecution> {
        match self.cache.get(key).await {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: CacheKey, value: CachedExecution) {
        self.cache.insert(key, value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(run_index: Option<usize>) -> CacheKey {
        CacheKey::new(
            "agent-a",
            &Dimension::new("safety"),
            &json!({"q": "hello"}),
            run_index,
        )
    }

    #[tokio::test]
    async fn test_cache_set_get() {
        let cache = MokaResultCache::new(3600);
        cache
            .set(key(None), CachedExecution { output: json!("out") })
            .await;
        let cached = cache.get(&key(None)).await;
        assert_eq!(cached.unwrap().output, json!("out"));
    }

    #[tokio::test]
    async fn test_run_index_separates_keys() {
        let cache = MokaResultCache::new(3600);
        cache
            .set(key(Some(0)), CachedExecution { output: json!(0) })
            .await;
        assert!(cache.get(&key(Some(1))).await.is_none());
        assert!(cache.get(&key(Some(0))).await.is_some());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache = MokaResultCache::new(3600);

        // Miss, then hit.
        cache.get(&key(None)).await;
        cache
            .set(key(None), CachedExecution { output: json!(1) })
            .await;
        cache.get(&key(None)).await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }
}
