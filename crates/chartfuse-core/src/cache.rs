//! Bounded, content-addressed cache of evaluated node values.
//!
//! Two segments: new entries are probationary and move to the protected
//! segment when hit again. Eviction takes the least recently used
//! probationary entry, and only touches the protected segment once the
//! probationary one is empty. Bounds are an entry count and an estimated
//! byte total.
//!
//! Concurrent requests for one fingerprint share a single computation
//! through the in-flight map.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ChartError, Result};
use crate::metrics::METRICS;
use crate::value::NodeValue;

type SharedResult = Shared<BoxFuture<'static, std::result::Result<NodeValue, Arc<ChartError>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Probationary,
    Protected,
}

struct Entry {
    value: NodeValue,
    size: usize,
    tier: Tier,
    tick: u64,
}

#[derive(Default)]
struct Segments {
    entries: HashMap<String, Entry>,
    /// Last-access tick to fingerprint, oldest first.
    probationary: BTreeMap<u64, String>,
    protected: BTreeMap<u64, String>,
    probationary_memory: usize,
    protected_memory: usize,
    tick: u64,
    /// Bumped by `clear`; computations started earlier do not insert.
    generation: u64,
}

impl Segments {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn total_memory(&self) -> usize {
        self.probationary_memory + self.protected_memory
    }

    fn get(&mut self, fingerprint: &str) -> Option<NodeValue> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(fingerprint)?;
        match entry.tier {
            Tier::Probationary => {
                self.probationary.remove(&entry.tick);
                self.probationary_memory -= entry.size;
                self.protected_memory += entry.size;
                entry.tier = Tier::Protected;
            }
            Tier::Protected => {
                self.protected.remove(&entry.tick);
            }
        }
        entry.tick = tick;
        self.protected.insert(tick, fingerprint.to_string());
        Some(entry.value.clone())
    }

    fn remove(&mut self, fingerprint: &str) -> Option<Entry> {
        let entry = self.entries.remove(fingerprint)?;
        match entry.tier {
            Tier::Probationary => {
                self.probationary.remove(&entry.tick);
                self.probationary_memory -= entry.size;
            }
            Tier::Protected => {
                self.protected.remove(&entry.tick);
                self.protected_memory -= entry.size;
            }
        }
        Some(entry)
    }

    fn insert(&mut self, fingerprint: String, value: NodeValue, size: usize) {
        self.remove(&fingerprint);
        let tick = self.next_tick();
        self.probationary.insert(tick, fingerprint.clone());
        self.probationary_memory += size;
        self.entries.insert(
            fingerprint,
            Entry {
                value,
                size,
                tier: Tier::Probationary,
                tick,
            },
        );
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .probationary
            .values()
            .next()
            .or_else(|| self.protected.values().next())
            .cloned();
        match victim.and_then(|fp| self.remove(&fp).map(|e| (fp, e))) {
            Some((fp, entry)) => {
                METRICS.inc_cache_evictions();
                debug!(fingerprint = %fp, size = entry.size, tier = ?entry.tier, "evicted cache entry");
                true
            }
            None => false,
        }
    }
}

struct InFlight {
    generation: u64,
    future: SharedResult,
}

struct Inner {
    capacity: Option<usize>,
    memory_limit: Option<usize>,
    segments: Mutex<Segments>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl Inner {
    fn over_bounds(&self, segments: &Segments) -> bool {
        self.capacity.is_some_and(|c| segments.entries.len() > c)
            || self
                .memory_limit
                .is_some_and(|m| segments.total_memory() > m)
    }

    /// Store `value` unless the cache was cleared after `generation` began.
    /// The generation is checked under the same lock `clear` takes.
    fn insert(&self, fingerprint: String, value: NodeValue, generation: u64) {
        let size = value.size_of();
        if self.memory_limit.is_some_and(|m| size > m) || self.capacity == Some(0) {
            debug!(fingerprint = %fingerprint, size, "value exceeds cache bounds, not stored");
            return;
        }
        let mut segments = self.segments.lock();
        if segments.generation != generation {
            debug!(fingerprint = %fingerprint, "cache cleared during computation, not stored");
            return;
        }
        segments.insert(fingerprint, value, size);
        while self.over_bounds(&segments) {
            if !segments.evict_lru() {
                break;
            }
        }
    }
}

/// Shared handle; clones refer to the same cache.
#[derive(Clone)]
pub struct ValueCache {
    inner: Arc<Inner>,
}

impl ValueCache {
    /// `None` leaves that bound unenforced.
    pub fn new(capacity: Option<usize>, memory_limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                memory_limit,
                segments: Mutex::new(Segments::default()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Look up a value, promoting the entry on a hit.
    pub fn get(&self, fingerprint: &str) -> Option<NodeValue> {
        let hit = self.inner.segments.lock().get(fingerprint);
        if hit.is_some() {
            METRICS.inc_cache_hits();
        }
        hit
    }

    /// Return the cached value for `fingerprint`, joining an in-flight
    /// computation if there is one, and otherwise running `compute` and
    /// caching its successful result. Errors reach every waiter and are
    /// never cached.
    pub async fn insert_or_join<F>(&self, fingerprint: &str, compute: F) -> Result<NodeValue>
    where
        F: Future<Output = Result<NodeValue>> + Send + 'static,
    {
        let future = {
            let mut in_flight = self.inner.in_flight.lock();
            let generation = {
                let mut segments = self.inner.segments.lock();
                if let Some(value) = segments.get(fingerprint) {
                    METRICS.inc_cache_hits();
                    return Ok(value);
                }
                segments.generation
            };
            match in_flight.get(fingerprint) {
                Some(running) => {
                    debug!(fingerprint, "joining in-flight computation");
                    running.future.clone()
                }
                None => {
                    METRICS.inc_cache_misses();
                    let future = self.spawn(fingerprint.to_string(), generation, compute);
                    in_flight.insert(
                        fingerprint.to_string(),
                        InFlight {
                            generation,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };
        future.await.map_err(|e| e.duplicate())
    }

    fn spawn<F>(&self, fingerprint: String, generation: u64, compute: F) -> SharedResult
    where
        F: Future<Output = Result<NodeValue>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = compute.await;
            if let Ok(value) = &result {
                inner.insert(fingerprint.clone(), value.clone(), generation);
            }
            let mut in_flight = inner.in_flight.lock();
            if in_flight
                .get(&fingerprint)
                .is_some_and(|f| f.generation == generation)
            {
                in_flight.remove(&fingerprint);
            }
            result.map_err(Arc::new)
        });
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join) => Err(Arc::new(ChartError::internal(format!(
                    "cache computation did not complete: {join}"
                )))),
            }
        }
        .boxed()
        .shared()
    }

    /// Drop every entry. Computations already running finish for their
    /// waiters but are not stored.
    pub fn clear(&self) {
        let mut in_flight = self.inner.in_flight.lock();
        let mut segments = self.inner.segments.lock();
        *segments = Segments {
            generation: segments.generation + 1,
            ..Segments::default()
        };
        in_flight.clear();
    }

    pub fn size(&self) -> usize {
        self.inner.segments.lock().entries.len()
    }

    pub fn total_memory(&self) -> usize {
        self.inner.segments.lock().total_memory()
    }

    pub fn protected_memory(&self) -> usize {
        self.inner.segments.lock().protected_memory
    }

    pub fn probationary_memory(&self) -> usize {
        self.inner.segments.lock().probationary_memory
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.inner.memory_limit
    }
}

impl std::fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCache")
            .field("capacity", &self.inner.capacity)
            .field("memory_limit", &self.inner.memory_limit)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scalar(n: usize) -> NodeValue {
        NodeValue::scalar(json!("x".repeat(n)))
    }

    fn fill(cache: &ValueCache, fp: &str, value: NodeValue) {
        cache.inner.insert(fp.to_string(), value, 0);
    }

    #[test]
    fn second_hit_promotes() {
        let cache = ValueCache::new(None, None);
        fill(&cache, "a", scalar(10));
        assert_eq!(cache.protected_memory(), 0);
        let before = cache.probationary_memory();
        assert!(cache.get("a").is_some());
        assert_eq!(cache.probationary_memory(), 0);
        assert_eq!(cache.protected_memory(), before);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn probationary_entries_are_evicted_first() {
        let cache = ValueCache::new(Some(2), None);
        fill(&cache, "old", scalar(1));
        cache.get("old");
        fill(&cache, "b", scalar(1));
        fill(&cache, "c", scalar(1));
        assert_eq!(cache.size(), 2);
        assert!(cache.get("old").is_some(), "protected entry survives");
        assert!(cache.get("b").is_none(), "oldest probationary entry goes first");
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn protected_entries_go_when_nothing_else_is_left() {
        let cache = ValueCache::new(Some(1), None);
        fill(&cache, "a", scalar(1));
        cache.get("a");
        fill(&cache, "b", scalar(1));
        // the newcomer is the only probationary entry
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn memory_never_exceeds_limit() {
        let limit = 200;
        let cache = ValueCache::new(None, Some(limit));
        for i in 0..50 {
            fill(&cache, &format!("fp{i}"), scalar(i * 3 % 70));
            if i % 3 == 0 {
                cache.get(&format!("fp{}", i / 2));
            }
            assert!(cache.total_memory() <= limit);
            assert_eq!(
                cache.total_memory(),
                cache.protected_memory() + cache.probationary_memory()
            );
        }
        fill(&cache, "huge", scalar(limit * 2));
        assert!(cache.get("huge").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_computation() {
        let cache = ValueCache::new(Some(8), None);
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .insert_or_join("shared", async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(NodeValue::scalar(json!(42)))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value.to_json(), json!(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test]
    async fn errors_reach_waiters_and_are_not_cached() {
        let cache = ValueCache::new(None, None);
        let err = cache
            .insert_or_join("bad", async { Err(ChartError::invalid_spec("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)));
        assert_eq!(cache.size(), 0);

        let ok = cache
            .insert_or_join("bad", async { Ok(NodeValue::scalar(json!(1))) })
            .await
            .unwrap();
        assert_eq!(ok.value.to_json(), json!(1));
    }

    #[tokio::test]
    async fn results_finishing_after_clear_are_discarded() {
        let cache = ValueCache::new(None, None);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .insert_or_join("slow", async move {
                        let _ = rx.await;
                        Ok(NodeValue::scalar(json!("stale")))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        cache.clear();
        let _ = tx.send(());
        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value.value.to_json(), json!("stale"));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn stores_from_before_a_clear_are_refused() {
        let cache = ValueCache::new(None, None);
        fill(&cache, "kept", scalar(1));
        cache.clear();
        // a computation that began under generation 0 lands after the clear
        cache.inner.insert("late".to_string(), scalar(1), 0);
        assert!(cache.get("late").is_none());
        cache.inner.insert("fresh".to_string(), scalar(1), 1);
        assert!(cache.get("fresh").is_some());
        assert!(cache.get("kept").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_racing_completion_never_keeps_the_result() {
        for round in 0..200 {
            let cache = ValueCache::new(None, None);
            let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
            let waiter = {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .insert_or_join("racy", async move {
                            let _ = started_tx.send(());
                            Ok(NodeValue::scalar(json!(round)))
                        })
                        .await
                })
            };
            started_rx.await.unwrap();
            let clearer = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.clear() })
            };
            clearer.await.unwrap();
            assert_eq!(waiter.await.unwrap().unwrap().value.to_json(), json!(round));
            // whether the store happened before or after the clear, it is gone
            assert_eq!(cache.size(), 0, "round {round}");
        }
    }
}
