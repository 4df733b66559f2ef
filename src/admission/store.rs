//! Counter storage behind a pluggable trait.
//!
//! The in-memory store is the single-process default. Multi-instance
//! deployments plug a shared backing store in through [`CounterStore`];
//! counters are then subject to that store's consistency model.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::counter::{CheckOutcome, Counter, CounterSpec};
use super::key::ScopeKey;
use crate::error::Result;

/// Trait for counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Consult and mutate the counter for `key`, creating it from `spec` on
    /// first access. The refill/evict/increment sequence runs under a
    /// per-key guard.
    async fn check(&self, key: &ScopeKey, spec: &CounterSpec, now: f64) -> Result<CheckOutcome>;

    /// Evict stale counters. Returns the number evicted.
    async fn sweep(
        &self,
        now: f64,
        idle_threshold_secs: u64,
        evict_token_buckets: bool,
    ) -> Result<usize>;

    /// Remove every counter tracking the given user (administrative
    /// override). Returns the number removed.
    async fn reset_user(&self, user_id: &str) -> Result<usize>;

    /// Number of live counters.
    fn counter_count(&self) -> usize;
}

/// In-memory counter store over a sharded concurrent map.
///
/// Each `DashMap` entry guard serializes all mutation for that key without
/// serializing unrelated keys, which is exactly the per-key mutual exclusion
/// the counters require.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<ScopeKey, Counter>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Drop all counters. Primarily useful for testing.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check(&self, key: &ScopeKey, spec: &CounterSpec, now: f64) -> Result<CheckOutcome> {
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, algorithm = %spec.algorithm, limit = spec.limit, "Creating counter");
                Counter::new(spec, now)
            });
        Ok(entry.value_mut().check(now, spec))
    }

    async fn sweep(
        &self,
        now: f64,
        idle_threshold_secs: u64,
        evict_token_buckets: bool,
    ) -> Result<usize> {
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| !counter.is_stale(now, idle_threshold_secs, evict_token_buckets));
        Ok(before.saturating_sub(self.counters.len()))
    }

    async fn reset_user(&self, user_id: &str) -> Result<usize> {
        let before = self.counters.len();
        self.counters.retain(|key, _| !key.tracks_user(user_id));
        Ok(before.saturating_sub(self.counters.len()))
    }

    fn counter_count(&self) -> usize {
        self.counters.len()
    }
}
