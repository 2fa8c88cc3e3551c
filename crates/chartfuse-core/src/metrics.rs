//! Global atomic counters for chartfuse observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event, or [`Metrics::snapshot`] to read them all.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    node_evaluations: AtomicU64,
    fallback_evaluations: AtomicU64,
    connection_queries: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub node_evaluations: u64,
    pub fallback_evaluations: u64,
    pub connection_queries: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            node_evaluations: AtomicU64::new(0),
            fallback_evaluations: AtomicU64::new(0),
            connection_queries: AtomicU64::new(0),
        }
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_misses", "counter incremented");
    }

    pub fn inc_cache_evictions(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_evictions", "counter incremented");
    }

    /// One node computed (not served from cache).
    pub fn inc_node_evaluations(&self) {
        self.node_evaluations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "node_evaluations", "counter incremented");
    }

    /// One dataset pipeline handed to the default engine.
    pub fn inc_fallback_evaluations(&self) {
        self.fallback_evaluations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fallback_evaluations", "counter incremented");
    }

    pub fn inc_connection_queries(&self) {
        self.connection_queries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "connection_queries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
            cache_evictions = s.cache_evictions,
            node_evaluations = s.node_evaluations,
            fallback_evaluations = s.fallback_evaluations,
            connection_queries = s.connection_queries,
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_evictions: self.cache_evictions(),
            node_evaluations: self.node_evaluations(),
            fallback_evaluations: self.fallback_evaluations(),
            connection_queries: self.connection_queries(),
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    pub fn node_evaluations(&self) -> u64 {
        self.node_evaluations.load(Ordering::Relaxed)
    }

    pub fn fallback_evaluations(&self) -> u64 {
        self.fallback_evaluations.load(Ordering::Relaxed)
    }

    pub fn connection_queries(&self) -> u64 {
        self.connection_queries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.cache_evictions.store(0, Ordering::Relaxed);
        self.node_evaluations.store(0, Ordering::Relaxed);
        self.fallback_evaluations.store(0, Ordering::Relaxed);
        self.connection_queries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_cache_hits();
        m.inc_cache_hits();
        m.inc_cache_misses();
        m.inc_fallback_evaluations();
        let s = m.snapshot();
        assert_eq!(s.cache_hits, 2);
        assert_eq!(s.cache_misses, 1);
        assert_eq!(s.fallback_evaluations, 1);
        assert_eq!(s.node_evaluations, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_cache_evictions();
        m.inc_node_evaluations();
        m.inc_connection_queries();
        m.reset();
        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                cache_hits: 0,
                cache_misses: 0,
                cache_evictions: 0,
                node_evaluations: 0,
                fallback_evaluations: 0,
                connection_queries: 0,
            }
        );
    }
}
