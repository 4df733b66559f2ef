//! Adaptive load-sensitive throttling.
//!
//! A background task samples an externally supplied system-load signal on a
//! fixed interval and publishes a global load factor. Role-default limits are
//! multiplied by the factor before evaluation, shrinking effective quotas
//! under stress. The factor is read-mostly shared state, never recomputed per
//! request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;

/// Load (0.0..=1.0) at or above which quotas are halved.
const CRITICAL_LOAD: f64 = 0.8;
/// Load at or above which quotas are reduced to three quarters.
const ELEVATED_LOAD: f64 = 0.6;

/// Source of the system-load signal (CPU, queue depth). Supplied by an
/// external collaborator; the engine only consumes the normalized value.
#[async_trait]
pub trait LoadSampler: Send + Sync {
    /// Current system load, normalized to `0.0..=1.0`.
    async fn sample(&self) -> Result<f64>;
}

/// Shared, read-mostly load factor cell.
///
/// Stored as f64 bits in an atomic so request-path reads never take a lock.
pub struct LoadFactor {
    bits: AtomicU64,
}

impl LoadFactor {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, factor: f64) {
        self.bits.store(factor.to_bits(), Ordering::Relaxed);
    }

    /// Apply the factor to a configured limit, floored to an integer.
    ///
    /// Clamped to at least one request: load shedding shrinks quotas, it
    /// never locks a role out entirely.
    pub fn scale(&self, limit: u64) -> u64 {
        ((limit as f64 * self.get()).floor() as u64).max(1)
    }
}

impl Default for LoadFactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a sampled load value onto the normal / elevated / critical tiers.
pub fn factor_for_load(load: f64) -> f64 {
    if load >= CRITICAL_LOAD {
        0.5
    } else if load >= ELEVATED_LOAD {
        0.75
    } else {
        1.0
    }
}

/// Periodically refresh `factor` from `sampler`. Sampler failure leaves the
/// limits unadjusted (factor 1.0).
pub async fn run_sampler(
    factor: Arc<LoadFactor>,
    sampler: Arc<dyn LoadSampler>,
    check_interval: Duration,
) {
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match sampler.sample().await {
            Ok(load) => {
                let new_factor = factor_for_load(load);
                if (new_factor - factor.get()).abs() > f64::EPSILON {
                    debug!(load, factor = new_factor, "Load factor changed");
                }
                factor.set(new_factor);
            }
            Err(e) => {
                warn!(error = %e, "Load sampler failed, leaving limits unadjusted");
                factor.set(1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdmissionError;

    struct StaticSampler(f64);

    #[async_trait]
    impl LoadSampler for StaticSampler {
        async fn sample(&self) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct FailingSampler;

    #[async_trait]
    impl LoadSampler for FailingSampler {
        async fn sample(&self) -> Result<f64> {
            Err(AdmissionError::LoadSampler("signal unavailable".into()))
        }
    }

    #[test]
    fn test_factor_tiers() {
        assert_eq!(factor_for_load(0.1), 1.0);
        assert_eq!(factor_for_load(0.59), 1.0);
        assert_eq!(factor_for_load(0.6), 0.75);
        assert_eq!(factor_for_load(0.79), 0.75);
        assert_eq!(factor_for_load(0.85), 0.5);
        assert_eq!(factor_for_load(1.0), 0.5);
    }

    #[test]
    fn test_scale_floors_but_keeps_at_least_one() {
        let factor = LoadFactor::new();
        factor.set(0.5);
        assert_eq!(factor.scale(60), 30);
        assert_eq!(factor.scale(1), 1);

        factor.set(0.75);
        assert_eq!(factor.scale(30), 22); // floor(22.5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_task_updates_factor() {
        let factor = Arc::new(LoadFactor::new());
        let handle = tokio::spawn(run_sampler(
            Arc::clone(&factor),
            Arc::new(StaticSampler(0.85)),
            Duration::from_secs(60),
        ));

        // First tick completes immediately once the task is polled
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factor.get(), 0.5);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_failure_resets_factor() {
        let factor = Arc::new(LoadFactor::new());
        factor.set(0.5);
        let handle = tokio::spawn(run_sampler(
            Arc::clone(&factor),
            Arc::new(FailingSampler),
            Duration::from_secs(60),
        ));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factor.get(), 1.0);
        handle.abort();
    }
}
