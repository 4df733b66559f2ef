//! Admission metrics, incremented synchronously during evaluation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use super::context::PlatformRole;
use super::counter::Algorithm;

/// Pure counters; external callers only ever read snapshots.
#[derive(Default)]
pub struct MetricsCollector {
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    denied_by_role: DashMap<String, u64>,
    denied_by_endpoint: DashMap<String, u64>,
    algorithm_usage: DashMap<String, u64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allowed(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self, role: PlatformRole, path: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.denied.fetch_add(1, Ordering::Relaxed);
        *self.denied_by_role.entry(role.to_string()).or_insert(0) += 1;
        *self
            .denied_by_endpoint
            .entry(path.to_string())
            .or_insert(0) += 1;
    }

    /// Record that a counter with the given algorithm was consulted.
    pub fn record_algorithm(&self, algorithm: Algorithm) {
        *self
            .algorithm_usage
            .entry(algorithm.to_string())
            .or_insert(0) += 1;
    }

    /// Owned point-in-time view of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            denied_by_role: collect(&self.denied_by_role),
            denied_by_endpoint: collect(&self.denied_by_endpoint),
            algorithm_usage: collect(&self.algorithm_usage),
        }
    }
}

fn collect(map: &DashMap<String, u64>) -> HashMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect()
}

/// Read-only metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub denied_by_role: HashMap<String, u64>,
    pub denied_by_endpoint: HashMap<String, u64>,
    pub algorithm_usage: HashMap<String, u64>,
}
