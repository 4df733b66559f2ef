//! The admission engine: middleware entry point and administrative surface.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::context::{AdmissionDecision, RoutingContext};
use super::janitor;
use super::load::{self, LoadFactor, LoadSampler};
use super::metrics::{MetricsCollector, MetricsSnapshot};
use super::policy::PolicyEvaluator;
use super::rules::{RateLimitRule, RuleRegistry};
use super::store::{CounterStore, InMemoryCounterStore};
use super::unix_now;
use crate::config::EngineConfig;
use crate::error::Result;

/// Orchestrates admission control for a request pipeline.
///
/// Per request: excluded paths short-circuit allow with no counting;
/// everything else goes through the policy evaluator. Internal failures
/// during evaluation fail open, so a limiter bug never becomes an outage.
pub struct AdmissionEngine {
    config: EngineConfig,
    registry: Arc<RuleRegistry>,
    store: Arc<dyn CounterStore>,
    evaluator: Arc<PolicyEvaluator>,
    metrics: Arc<MetricsCollector>,
    load_factor: Arc<LoadFactor>,
}

impl AdmissionEngine {
    /// Build an engine with the default in-memory counter store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryCounterStore::new()))
    }

    /// Build an engine over a pluggable counter store (e.g. a shared backing
    /// store for multi-instance deployments).
    pub fn with_store(config: EngineConfig, store: Arc<dyn CounterStore>) -> Self {
        let registry = Arc::new(RuleRegistry::new(config.role_limits.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let load_factor = Arc::new(LoadFactor::new());
        let evaluator = Arc::new(PolicyEvaluator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&load_factor),
            Arc::clone(&metrics),
            config.priority_multiplier,
        ));
        info!(
            excluded_paths = config.excluded_paths.len(),
            priority_multiplier = config.priority_multiplier,
            "Admission engine initialized"
        );
        Self {
            config,
            registry,
            store,
            evaluator,
            metrics,
            load_factor,
        }
    }

    /// Decide whether a request may proceed. Never fails: evaluation errors
    /// are logged and the request is allowed.
    pub async fn check_request(
        &self,
        ctx: &RoutingContext,
        path: &str,
        method: &str,
    ) -> AdmissionDecision {
        self.check_request_at(ctx, path, method, unix_now()).await
    }

    async fn check_request_at(
        &self,
        ctx: &RoutingContext,
        path: &str,
        method: &str,
        now: f64,
    ) -> AdmissionDecision {
        if self.is_excluded(path) {
            return AdmissionDecision::bypass(now as u64);
        }

        match self.evaluator.evaluate(ctx, path, method, now).await {
            Ok(decision) => {
                if decision.allowed {
                    self.metrics.record_allowed();
                } else {
                    debug!(path, method, role = %ctx.platform_role, "Request rate limited");
                    self.metrics.record_denied(ctx.platform_role, path);
                }
                decision
            }
            Err(e) => {
                // Rate limiting is protective, not a correctness guarantee.
                error!(error = %e, path, method, "Admission evaluation failed, failing open");
                self.metrics.record_allowed();
                AdmissionDecision::bypass(now as u64)
            }
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.config
            .excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    // --- administrative surface ---

    /// Register or replace a rate limit rule at runtime.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        self.registry.add_rule(rule)
    }

    /// Remove a rule by id. Returns whether a rule was removed.
    pub fn remove_rule(&self, id: &str) -> bool {
        self.registry.remove_rule(id)
    }

    /// Add an identity to the priority set. Idempotent.
    pub fn add_priority_identity(&self, identity: &str) -> bool {
        self.evaluator.add_priority(identity)
    }

    /// Remove an identity from the priority set. Idempotent.
    pub fn remove_priority_identity(&self, identity: &str) -> bool {
        self.evaluator.remove_priority(identity)
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Administrative override: drop all counters tracking a user, giving
    /// them a fresh quota. Returns the number of counters removed.
    pub async fn reset_user(&self, user_id: &str) -> Result<usize> {
        let removed = self.store.reset_user(user_id).await?;
        info!(user_id, removed, "Reset counters for user");
        Ok(removed)
    }

    /// Number of live counters in the store.
    pub fn counter_count(&self) -> usize {
        self.store.counter_count()
    }

    pub fn rule_count(&self) -> usize {
        self.registry.rule_count()
    }

    /// Spawn the background janitor task.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        tokio::spawn(janitor::run(
            Arc::clone(&self.store),
            self.config.janitor.clone(),
        ))
    }

    /// Spawn the adaptive load sampler task over an external load signal.
    pub fn spawn_load_sampler(&self, sampler: Arc<dyn LoadSampler>) -> JoinHandle<()> {
        tokio::spawn(load::run_sampler(
            Arc::clone(&self.load_factor),
            sampler,
            std::time::Duration::from_secs(self.config.adaptive.check_interval_secs),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::context::PlatformRole;
    use crate::admission::counter::{Algorithm, CheckOutcome, CounterSpec};
    use crate::admission::key::ScopeKey;
    use crate::admission::rules::RuleLimits;
    use crate::error::AdmissionError;
    use async_trait::async_trait;

    const T0: f64 = 1_700_000_040.0;

    fn admin_rule() -> RateLimitRule {
        RateLimitRule {
            id: "admin_api".to_string(),
            name: "Admin API".to_string(),
            path_pattern: "/api/v1/admin/**".to_string(),
            methods: None,
            roles: Some(vec![PlatformRole::Admin]),
            algorithm: Algorithm::FixedWindow,
            limits: RuleLimits {
                requests_per_minute: 30,
                requests_per_hour: None,
                requests_per_day: None,
                burst_limit: None,
            },
            scope_limits: None,
        }
    }

    fn admin_ctx() -> RoutingContext {
        RoutingContext {
            user_id: Some("admin-1".to_string()),
            organization_id: None,
            platform_role: PlatformRole::Admin,
            client_ip: Some("10.0.0.1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_excluded_paths_bypass_counting() {
        let engine = AdmissionEngine::new(EngineConfig::default());
        let ctx = RoutingContext::default();

        let decision = engine.check_request(&ctx, "/health", "GET").await;
        assert!(decision.allowed);
        let decision = engine.check_request(&ctx, "/metrics", "GET").await;
        assert!(decision.allowed);

        assert_eq!(engine.metrics().total, 0);
        assert_eq!(engine.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_admin_rule_fixed_window_scenario() {
        let engine = AdmissionEngine::new(EngineConfig::default());
        engine.add_rule(admin_rule()).unwrap();
        let ctx = admin_ctx();

        // Evaluate at a fixed instant so the whole burst lands in one window
        for _ in 0..30 {
            let d = engine
                .check_request_at(&ctx, "/api/v1/admin/users", "GET", T0)
                .await;
            assert!(d.allowed);
        }
        let denied = engine
            .check_request_at(&ctx, "/api/v1/admin/users", "GET", T0)
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after.is_some());

        // The next minute boundary admits again
        let next_window = ((T0 as u64 / 60) + 1) * 60;
        let d = engine
            .check_request_at(&ctx, "/api/v1/admin/users", "GET", next_window as f64)
            .await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_role_filter_excludes_other_roles_from_rule() {
        let engine = AdmissionEngine::new(EngineConfig::default());
        engine.add_rule(admin_rule()).unwrap();

        // A member on the admin path falls through to role defaults, not the
        // admin rule
        let ctx = RoutingContext {
            user_id: Some("m-1".to_string()),
            platform_role: PlatformRole::Member,
            ..Default::default()
        };
        let d = engine
            .check_request_at(&ctx, "/api/v1/admin/users", "GET", T0)
            .await;
        assert!(d.allowed);
        assert_eq!(engine.counter_count(), 1);
    }

    #[tokio::test]
    async fn test_metrics_recorded_for_allowed_and_denied() {
        let mut config = EngineConfig::default();
        config.role_limits.insert(PlatformRole::Anonymous, 1);
        let engine = AdmissionEngine::new(config);
        let ctx = RoutingContext {
            client_ip: Some("1.2.3.4".to_string()),
            ..Default::default()
        };

        assert!(engine.check_request_at(&ctx, "/api/x", "GET", T0).await.allowed);
        assert!(!engine.check_request_at(&ctx, "/api/x", "GET", T0).await.allowed);

        let snap = engine.metrics();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.allowed, 1);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.denied_by_role["anonymous"], 1);
        assert_eq!(snap.denied_by_endpoint["/api/x"], 1);
        assert_eq!(snap.algorithm_usage["sliding_window"], 2);
    }

    #[tokio::test]
    async fn test_reset_user_restores_quota() {
        let mut config = EngineConfig::default();
        config.role_limits.insert(PlatformRole::Member, 1);
        let engine = AdmissionEngine::new(config);
        let ctx = RoutingContext {
            user_id: Some("42".to_string()),
            platform_role: PlatformRole::Member,
            ..Default::default()
        };

        assert!(engine.check_request_at(&ctx, "/api/x", "GET", T0).await.allowed);
        assert!(!engine.check_request_at(&ctx, "/api/x", "GET", T0).await.allowed);

        let removed = engine.reset_user("42").await.unwrap();
        assert_eq!(removed, 1);
        assert!(engine.check_request_at(&ctx, "/api/x", "GET", T0).await.allowed);
    }

    #[tokio::test]
    async fn test_rule_admin_add_and_remove() {
        let engine = AdmissionEngine::new(EngineConfig::default());
        engine.add_rule(admin_rule()).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert!(engine.remove_rule("admin_api"));
        assert!(!engine.remove_rule("admin_api"));
        assert_eq!(engine.rule_count(), 0);

        // Malformed rules never enter the registry
        let mut bad = admin_rule();
        bad.limits.requests_per_minute = 0;
        assert!(matches!(
            engine.add_rule(bad),
            Err(AdmissionError::Config(_))
        ));
        assert_eq!(engine.rule_count(), 0);
    }

    /// A counter store that always fails, for exercising the fail-open path.
    struct FaultyStore;

    #[async_trait]
    impl CounterStore for FaultyStore {
        async fn check(
            &self,
            _key: &ScopeKey,
            _spec: &CounterSpec,
            _now: f64,
        ) -> crate::error::Result<CheckOutcome> {
            Err(AdmissionError::Store("injected fault".into()))
        }

        async fn sweep(&self, _: f64, _: u64, _: bool) -> crate::error::Result<usize> {
            Err(AdmissionError::Store("injected fault".into()))
        }

        async fn reset_user(&self, _: &str) -> crate::error::Result<usize> {
            Err(AdmissionError::Store("injected fault".into()))
        }

        fn counter_count(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_counter_store_fault_fails_open() {
        let engine = AdmissionEngine::with_store(EngineConfig::default(), Arc::new(FaultyStore));
        let ctx = admin_ctx();

        let decision = engine.check_request_at(&ctx, "/api/v1/si/x", "POST", T0).await;
        assert!(decision.allowed);
        assert_eq!(engine.metrics().allowed, 1);
        assert_eq!(engine.metrics().denied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_janitor_prunes_store() {
        let engine = AdmissionEngine::new(EngineConfig::default());
        let ctx = admin_ctx();

        // Counters created in the distant past are stale relative to the
        // wall clock the janitor sweeps with
        engine
            .check_request_at(&ctx, "/api/v1/x", "GET", unix_now() - 7200.0)
            .await;
        assert_eq!(engine.counter_count(), 1);

        let handle = engine.spawn_janitor();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.counter_count(), 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sampler_halves_role_defaults() {
        struct HighLoad;

        #[async_trait]
        impl crate::admission::load::LoadSampler for HighLoad {
            async fn sample(&self) -> crate::error::Result<f64> {
                Ok(0.85)
            }
        }

        let mut config = EngineConfig::default();
        config.role_limits.insert(PlatformRole::Member, 4);
        let engine = AdmissionEngine::new(config);
        let handle = engine.spawn_load_sampler(Arc::new(HighLoad));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let ctx = RoutingContext {
            user_id: Some("42".to_string()),
            platform_role: PlatformRole::Member,
            ..Default::default()
        };
        let mut admitted = 0;
        for _ in 0..4 {
            if engine.check_request_at(&ctx, "/api/x", "GET", T0).await.allowed {
                admitted += 1;
            }
        }
        // floor(4 * 0.5) = 2
        assert_eq!(admitted, 2);
        handle.abort();
    }
}
