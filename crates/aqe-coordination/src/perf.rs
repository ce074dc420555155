//! Hot-path optimization for CRDT and index access.
//!
//! Wraps the coordination manager's state access with an LRU value cache
//! with lazy loading, batched update queueing grouped by CRDT id, and a
//! buffer pool that recycles delta scratch space.

use log::debug;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfConfig {
    /// LRU capacity for hot value lookups.
    pub cache_capacity: usize,
    /// Accesses of a cold key before it is loaded and cached.
    pub lazy_access_threshold: u32,
    /// Queued updates before a flush.
    pub batch_update_size: usize,
    /// Recycled scratch buffers retained.
    pub pool_capacity: usize,
    /// Capacity of a fresh scratch buffer.
    pub pool_buffer_bytes: usize,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1_024,
            lazy_access_threshold: 2,
            batch_update_size: 32,
            pool_capacity: 64,
            pool_buffer_bytes: 4 * 1024,
        }
    }
}

/// One queued CRDT update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedUpdate {
    pub crdt_id: String,
    pub operation: serde_json::Value,
}

/// Optimizer counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub lazy_deferrals: u64,
    pub batches_flushed: u64,
    pub updates_flushed: u64,
    pub buffers_recycled: u64,
}

/// LRU cache, batched updates, and buffer pool for the hot paths.
pub struct PerformanceOptimizer {
    config: PerfConfig,
    cache: Mutex<LruCache<String, serde_json::Value>>,
    access_counts: Mutex<HashMap<String, u32>>,
    queued: Mutex<Vec<QueuedUpdate>>,
    pool: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<PerfStats>,
}

impl PerformanceOptimizer {
    /// Create an optimizer.
    pub fn new(config: PerfConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).expect("non-zero");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            access_counts: Mutex::new(HashMap::new()),
            queued: Mutex::new(Vec::new()),
            pool: Mutex::new(Vec::new()),
            stats: Mutex::new(PerfStats::default()),
            config,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PerfStats {
        self.stats.lock().expect("stats lock").clone()
    }

    /// Look up a value through the cache. Cold keys are counted and only
    /// loaded once they cross the lazy-access threshold; hot keys are
    /// served from the cache without touching the loader.
    pub fn cached_value<F>(&self, key: &str, loader: F) -> Option<serde_json::Value>
    where
        F: FnOnce() -> Option<serde_json::Value>,
    {
        {
            let mut cache = self.cache.lock().expect("cache lock");
            if let Some(value) = cache.get(key) {
                self.stats.lock().expect("stats lock").cache_hits += 1;
                return Some(value.clone());
            }
        }

        let mut stats = self.stats.lock().expect("stats lock");
        stats.cache_misses += 1;

        let accesses = {
            let mut counts = self.access_counts.lock().expect("counts lock");
            let entry = counts.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if accesses < self.config.lazy_access_threshold {
            stats.lazy_deferrals += 1;
            return None;
        }
        drop(stats);

        let value = loader()?;
        self.cache
            .lock()
            .expect("cache lock")
            .put(key.to_string(), value.clone());
        self.access_counts
            .lock()
            .expect("counts lock")
            .remove(key);
        Some(value)
    }

    /// Invalidate a cached value after a mutation.
    pub fn invalidate(&self, key: &str) {
        self.cache.lock().expect("cache lock").pop(key);
    }

    /// Queue an update. When the batch fills, all queued updates are
    /// returned grouped by CRDT id for a single-pass flush.
    pub fn queue_update(&self, update: QueuedUpdate) -> Option<Vec<(String, Vec<QueuedUpdate>)>> {
        let mut queued = self.queued.lock().expect("queue lock");
        queued.push(update);
        if queued.len() < self.config.batch_update_size {
            return None;
        }
        let drained: Vec<QueuedUpdate> = queued.drain(..).collect();
        drop(queued);
        Some(self.group_and_count(drained))
    }

    /// Flush whatever is queued, regardless of batch size.
    pub fn flush_updates(&self) -> Vec<(String, Vec<QueuedUpdate>)> {
        let drained: Vec<QueuedUpdate> = {
            let mut queued = self.queued.lock().expect("queue lock");
            queued.drain(..).collect()
        };
        if drained.is_empty() {
            return Vec::new();
        }
        self.group_and_count(drained)
    }

    fn group_and_count(&self, drained: Vec<QueuedUpdate>) -> Vec<(String, Vec<QueuedUpdate>)> {
        let mut stats = self.stats.lock().expect("stats lock");
        stats.batches_flushed += 1;
        stats.updates_flushed += drained.len() as u64;
        drop(stats);

        let mut grouped: HashMap<String, Vec<QueuedUpdate>> = HashMap::new();
        for update in drained {
            grouped.entry(update.crdt_id.clone()).or_default().push(update);
        }
        let mut result: Vec<(String, Vec<QueuedUpdate>)> = grouped.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        debug!("flushing {} update groups", result.len());
        result
    }

    /// Take a scratch buffer from the pool (or allocate one).
    pub fn acquire_buffer(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().expect("pool lock");
        match pool.pop() {
            Some(buffer) => {
                self.stats.lock().expect("stats lock").buffers_recycled += 1;
                buffer
            }
            None => Vec::with_capacity(self.config.pool_buffer_bytes),
        }
    }

    /// Return a scratch buffer to the pool.
    pub fn release_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut pool = self.pool.lock().expect("pool lock");
        if pool.len() < self.config.pool_capacity {
            pool.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer(threshold: u32, batch: usize) -> PerformanceOptimizer {
        PerformanceOptimizer::new(PerfConfig {
            lazy_access_threshold: threshold,
            batch_update_size: batch,
            cache_capacity: 4,
            ..PerfConfig::default()
        })
    }

    #[test]
    fn test_lazy_loading_defers_until_threshold() {
        let perf = optimizer(3, 32);
        let mut loads = 0;

        // first two accesses are deferred
        for _ in 0..2 {
            let value = perf.cached_value("counter-1", || {
                loads += 1;
                Some(serde_json::json!(42))
            });
            assert!(value.is_none());
        }
        assert_eq!(loads, 0);

        // the third access loads and caches
        let value = perf.cached_value("counter-1", || {
            loads += 1;
            Some(serde_json::json!(42))
        });
        assert_eq!(value, Some(serde_json::json!(42)));
        assert_eq!(loads, 1);

        // now served from cache
        let value = perf.cached_value("counter-1", || {
            loads += 1;
            Some(serde_json::json!(43))
        });
        assert_eq!(value, Some(serde_json::json!(42)));
        assert_eq!(loads, 1);
        assert_eq!(perf.stats().cache_hits, 1);
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let perf = optimizer(1, 32);
        perf.cached_value("k", || Some(serde_json::json!(1)));
        perf.invalidate("k");

        let value = perf.cached_value("k", || Some(serde_json::json!(2)));
        assert_eq!(value, Some(serde_json::json!(2)));
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let perf = optimizer(1, 32);
        for i in 0..5 {
            perf.cached_value(&format!("k{i}"), || Some(serde_json::json!(i)));
        }
        // capacity 4: k0 was evicted, so the next access is deferred again
        // (threshold 1 means a single access reloads immediately)
        let value = perf.cached_value("k0", || Some(serde_json::json!("reloaded")));
        assert_eq!(value, Some(serde_json::json!("reloaded")));
    }

    #[test]
    fn test_batched_updates_flush_grouped() {
        let perf = optimizer(1, 4);
        for i in 0..3 {
            let flushed = perf.queue_update(QueuedUpdate {
                crdt_id: format!("c{}", i % 2),
                operation: serde_json::json!({ "inc": 1 }),
            });
            assert!(flushed.is_none());
        }

        let flushed = perf
            .queue_update(QueuedUpdate {
                crdt_id: "c0".to_string(),
                operation: serde_json::json!({ "inc": 1 }),
            })
            .expect("batch should flush");

        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, "c0");
        assert_eq!(flushed[0].1.len(), 3);
        assert_eq!(flushed[1].0, "c1");
        assert_eq!(flushed[1].1.len(), 1);

        let stats = perf.stats();
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.updates_flushed, 4);
    }

    #[test]
    fn test_explicit_flush_drains_partial_batch() {
        let perf = optimizer(1, 32);
        perf.queue_update(QueuedUpdate {
            crdt_id: "c".to_string(),
            operation: serde_json::json!(null),
        });

        let flushed = perf.flush_updates();
        assert_eq!(flushed.len(), 1);
        assert!(perf.flush_updates().is_empty());
    }

    #[test]
    fn test_buffer_pool_recycles() {
        let perf = optimizer(1, 32);
        let mut buffer = perf.acquire_buffer();
        buffer.extend_from_slice(b"scratch");
        perf.release_buffer(buffer);

        let recycled = perf.acquire_buffer();
        assert!(recycled.is_empty());
        assert_eq!(perf.stats().buffers_recycled, 1);
    }
}
