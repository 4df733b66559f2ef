//! Admission control: counters, rules, policy evaluation, and orchestration.

pub mod context;
pub mod counter;
pub mod engine;
pub mod janitor;
pub mod key;
pub mod load;
pub mod metrics;
pub mod policy;
pub mod rules;
pub mod store;

pub use context::{AdmissionDecision, PlatformRole, RoutingContext};
pub use counter::Algorithm;
pub use engine::AdmissionEngine;
pub use load::LoadSampler;
pub use metrics::MetricsSnapshot;
pub use rules::{RateLimitRule, RuleLimits, RuleRegistry, ScopeLimits};
pub use store::{CounterStore, InMemoryCounterStore};

/// Wall-clock time in seconds since the unix epoch.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
