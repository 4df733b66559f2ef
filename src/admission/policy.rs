//! Policy evaluation: resolves applicable rules and scope keys for a request,
//! applies adaptive and priority adjustments, and consults the counter store.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::context::{AdmissionDecision, PlatformRole, RoutingContext};
use super::counter::{Algorithm, CheckOutcome, CounterSpec};
use super::key::{Scope, ScopeKey};
use super::load::LoadFactor;
use super::metrics::MetricsCollector;
use super::rules::{RateLimitRule, RuleRegistry};
use super::store::CounterStore;
use crate::error::Result;

/// Rule id under which role-default counters are tracked.
const DEFAULTS_RULE_ID: &str = "defaults";

/// Evaluates requests against the rule registry and counter store.
pub struct PolicyEvaluator {
    registry: Arc<RuleRegistry>,
    store: Arc<dyn CounterStore>,
    load_factor: Arc<LoadFactor>,
    metrics: Arc<MetricsCollector>,
    /// Identities whose limits are boosted by `priority_multiplier`
    priority: RwLock<HashSet<String>>,
    priority_multiplier: f64,
}

impl PolicyEvaluator {
    pub fn new(
        registry: Arc<RuleRegistry>,
        store: Arc<dyn CounterStore>,
        load_factor: Arc<LoadFactor>,
        metrics: Arc<MetricsCollector>,
        priority_multiplier: f64,
    ) -> Self {
        Self {
            registry,
            store,
            load_factor,
            metrics,
            priority: RwLock::new(HashSet::new()),
            priority_multiplier,
        }
    }

    /// Add an identity to the priority set. Idempotent.
    pub fn add_priority(&self, identity: &str) -> bool {
        self.priority.write().insert(identity.to_string())
    }

    /// Remove an identity from the priority set. Idempotent.
    pub fn remove_priority(&self, identity: &str) -> bool {
        self.priority.write().remove(identity)
    }

    pub fn is_priority(&self, identity: &str) -> bool {
        self.priority.read().contains(identity)
    }

    /// Boost a limit for priority requesters. Only per-requester dimensions
    /// are boosted: the global, organization, and rule-aggregate counters are
    /// shared with other callers, and a boosted spec there would reshape the
    /// shared counter for everyone (token buckets freeze capacity at
    /// creation). The boosted value is floored, clamped to at least one
    /// request so a boost can never zero out a quota.
    fn effective_limit(&self, identity: &str, scope: Scope, limit: u64) -> u64 {
        let per_requester = matches!(scope, Scope::User | Scope::Ip | Scope::RoleDefault);
        if per_requester && self.is_priority(identity) {
            ((limit as f64 * self.priority_multiplier).floor() as u64).max(1)
        } else {
            limit
        }
    }

    /// Evaluate a request against every applicable rule, or against the
    /// role-default limits when nothing matches.
    pub async fn evaluate(
        &self,
        ctx: &RoutingContext,
        path: &str,
        method: &str,
        now: f64,
    ) -> Result<AdmissionDecision> {
        let rules = self.registry.find_applicable(path, method, ctx.platform_role);
        if rules.is_empty() {
            return self.evaluate_role_default(ctx, now).await;
        }

        trace!(path, method, matched = rules.len(), "Evaluating matched rules");

        let mut aggregate = OutcomeAggregate::new(now);
        for rule in &rules {
            match self.evaluate_rule(rule, ctx, now).await? {
                RuleOutcome::Denied(outcome) => {
                    debug!(rule_id = %rule.id, path, "Request denied by rule");
                    return Ok(denied_decision(&outcome));
                }
                RuleOutcome::Allowed(partial) => aggregate.merge_all(partial),
            }
        }
        Ok(aggregate.into_allowed())
    }

    /// Evaluate one rule. Scope checks run in fixed order (user, ip, org,
    /// global) before the rule's aggregate limits; the first denial
    /// short-circuits.
    ///
    /// Scopes checked before the denying one keep their consumed quota; the
    /// counters mutate on read and denied requests are not refunded.
    async fn evaluate_rule(
        &self,
        rule: &RateLimitRule,
        ctx: &RoutingContext,
        now: f64,
    ) -> Result<RuleOutcome> {
        let mut outcomes = Vec::new();
        for (scope, identity, limit, burst, window_secs) in self.rule_checks(rule, ctx) {
            let effective = self.effective_limit(ctx.identity(), scope, limit);
            let spec = CounterSpec {
                algorithm: check_algorithm(rule.algorithm, window_secs),
                limit: effective,
                window_secs,
                burst: burst.map(|b| self.effective_limit(ctx.identity(), scope, b)),
            };
            let key = ScopeKey::new(&rule.id, scope, &identity);
            self.metrics.record_algorithm(spec.algorithm);
            let outcome = self.store.check(&key, &spec, now).await?;
            if !outcome.allowed {
                return Ok(RuleOutcome::Denied(outcome));
            }
            outcomes.push(outcome);
        }
        Ok(RuleOutcome::Allowed(outcomes))
    }

    /// The ordered list of counter checks a rule requires for this request:
    /// `(scope, identity, limit, burst, window_secs)`.
    fn rule_checks(
        &self,
        rule: &RateLimitRule,
        ctx: &RoutingContext,
    ) -> Vec<(Scope, String, u64, Option<u64>, u64)> {
        let mut checks = Vec::new();
        if let Some(ref scopes) = rule.scope_limits {
            if let (Some(limit), Some(user)) = (scopes.per_user, ctx.user_id.as_deref()) {
                checks.push((Scope::User, user.to_string(), limit, None, 60));
            }
            if let (Some(limit), Some(ip)) = (scopes.per_ip, ctx.client_ip.as_deref()) {
                checks.push((Scope::Ip, ip.to_string(), limit, None, 60));
            }
            if let (Some(limit), Some(org)) = (scopes.per_organization, ctx.organization_id.as_deref()) {
                checks.push((Scope::Organization, org.to_string(), limit, None, 60));
            }
            if let Some(limit) = scopes.global {
                checks.push((Scope::Global, "all".to_string(), limit, None, 60));
            }
        }
        // The rule's own aggregate limits come last
        checks.push((
            Scope::Rule,
            "minute".to_string(),
            rule.limits.requests_per_minute,
            rule.limits.burst_limit,
            60,
        ));
        if let Some(limit) = rule.limits.requests_per_hour {
            checks.push((Scope::Rule, "hour".to_string(), limit, None, 3600));
        }
        if let Some(limit) = rule.limits.requests_per_day {
            checks.push((Scope::Rule, "day".to_string(), limit, None, 86400));
        }
        checks
    }

    /// No rule matched: a single sliding-window check against the role's
    /// default limit, keyed per identity, scaled by the load factor and any
    /// priority boost.
    async fn evaluate_role_default(
        &self,
        ctx: &RoutingContext,
        now: f64,
    ) -> Result<AdmissionDecision> {
        let base = self.registry.role_limit(ctx.platform_role);
        let load_adjusted = self.load_factor.scale(base);
        let identity = ctx.identity();
        let limit = self.effective_limit(identity, Scope::RoleDefault, load_adjusted);

        let spec = CounterSpec::per_minute(Algorithm::SlidingWindow, limit);
        let key = ScopeKey::new(DEFAULTS_RULE_ID, Scope::RoleDefault, identity);
        self.metrics.record_algorithm(spec.algorithm);

        trace!(
            role = %ctx.platform_role,
            identity,
            limit,
            "Evaluating role-default limit"
        );

        let outcome = self.store.check(&key, &spec, now).await?;
        if outcome.allowed {
            let mut aggregate = OutcomeAggregate::new(now);
            aggregate.merge(&outcome);
            Ok(aggregate.into_allowed())
        } else {
            debug!(role = %ctx.platform_role, identity, "Request denied by role-default limit");
            Ok(denied_decision(&outcome))
        }
    }
}

enum RuleOutcome {
    Allowed(Vec<CheckOutcome>),
    Denied(CheckOutcome),
}

fn check_algorithm(rule_algorithm: Algorithm, window_secs: u64) -> Algorithm {
    // Hour/day horizons are coarse caps; an exact or token-based count over
    // those spans buys nothing, so they always use fixed windows.
    if window_secs > 60 {
        Algorithm::FixedWindow
    } else {
        rule_algorithm
    }
}

fn denied_decision(outcome: &CheckOutcome) -> AdmissionDecision {
    AdmissionDecision {
        allowed: false,
        remaining: 0,
        reset_time: outcome.reset_at,
        retry_after: outcome.retry_after,
    }
}

/// Folds per-check outcomes into the most restrictive allowed decision.
struct OutcomeAggregate {
    remaining: u64,
    reset_time: u64,
}

impl OutcomeAggregate {
    fn new(now: f64) -> Self {
        Self {
            remaining: u64::MAX,
            reset_time: now.ceil() as u64,
        }
    }

    fn merge(&mut self, outcome: &CheckOutcome) {
        self.remaining = self.remaining.min(outcome.remaining);
        self.reset_time = self.reset_time.max(outcome.reset_at);
    }

    fn merge_all(&mut self, outcomes: Vec<CheckOutcome>) {
        for outcome in &outcomes {
            self.merge(outcome);
        }
    }

    fn into_allowed(self) -> AdmissionDecision {
        AdmissionDecision {
            allowed: true,
            remaining: if self.remaining == u64::MAX { 0 } else { self.remaining },
            reset_time: self.reset_time,
            retry_after: None,
        }
    }
}
