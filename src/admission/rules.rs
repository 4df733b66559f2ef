//! Rate limit rule configuration and matching.
//!
//! Rules are declarative match-and-limit records loaded from configuration or
//! added at runtime through the administrative surface. Matching is inclusive:
//! a request may match zero, one, or several rules, and the policy evaluator
//! enforces every match.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use super::context::PlatformRole;
use super::counter::Algorithm;
use crate::error::{AdmissionError, Result};

/// Limit applied when a role has no entry in the defaults table.
const FALLBACK_ANONYMOUS_LIMIT: u64 = 30;

/// Aggregate limits for a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleLimits {
    /// Primary limit, enforced with the rule's chosen algorithm
    pub requests_per_minute: u64,
    /// Optional longer-horizon caps, enforced as fixed windows
    #[serde(default)]
    pub requests_per_hour: Option<u64>,
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    /// Token bucket capacity override
    #[serde(default)]
    pub burst_limit: Option<u64>,
}

/// Optional per-dimension overrides, each independently enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeLimits {
    #[serde(default)]
    pub per_user: Option<u64>,
    #[serde(default)]
    pub per_ip: Option<u64>,
    #[serde(default)]
    pub per_organization: Option<u64>,
    #[serde(default)]
    pub global: Option<u64>,
}

/// A declarative rate limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Stable identity; generated when omitted
    #[serde(default = "generate_rule_id")]
    pub id: String,
    /// Human-readable name for diagnostics
    #[serde(default)]
    pub name: String,
    /// Glob-style path pattern: `*` matches one segment (or part of one),
    /// `**` matches any suffix of segments
    pub path_pattern: String,
    /// HTTP methods this rule applies to; absent matches all
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Platform roles this rule applies to; absent matches all
    #[serde(default)]
    pub roles: Option<Vec<PlatformRole>>,
    /// Counting algorithm, fixed for the rule's lifetime
    pub algorithm: Algorithm,
    pub limits: RuleLimits,
    #[serde(default)]
    pub scope_limits: Option<ScopeLimits>,
}

fn generate_rule_id() -> String {
    Uuid::new_v4().to_string()
}

impl RateLimitRule {
    /// Whether this rule applies to the given request.
    pub fn matches(&self, path: &str, method: &str, role: PlatformRole) -> bool {
        if !path_matches(&self.path_pattern, path) {
            return false;
        }
        if let Some(ref methods) = self.methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                return false;
            }
        }
        if let Some(ref roles) = self.roles {
            if !roles.contains(&role) {
                return false;
            }
        }
        true
    }

    /// Validate the rule at registration time. Invalid rules never enter the
    /// live registry.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AdmissionError::Config("rule id must not be empty".into()));
        }
        if !self.path_pattern.starts_with('/') {
            return Err(AdmissionError::Config(format!(
                "rule '{}': path_pattern must start with '/'",
                self.id
            )));
        }
        if self.limits.requests_per_minute == 0 {
            return Err(AdmissionError::Config(format!(
                "rule '{}': requests_per_minute must be positive",
                self.id
            )));
        }
        for (name, value) in [
            ("requests_per_hour", self.limits.requests_per_hour),
            ("requests_per_day", self.limits.requests_per_day),
            ("burst_limit", self.limits.burst_limit),
        ] {
            if value == Some(0) {
                return Err(AdmissionError::Config(format!(
                    "rule '{}': {} must be positive when set",
                    self.id, name
                )));
            }
        }
        if let Some(ref scopes) = self.scope_limits {
            for (name, value) in [
                ("per_user", scopes.per_user),
                ("per_ip", scopes.per_ip),
                ("per_organization", scopes.per_organization),
                ("global", scopes.global),
            ] {
                if value == Some(0) {
                    return Err(AdmissionError::Config(format!(
                        "rule '{}': scope limit {} must be positive when set",
                        self.id, name
                    )));
                }
            }
        }
        if let Some(ref methods) = self.methods {
            if methods.is_empty() {
                return Err(AdmissionError::Config(format!(
                    "rule '{}': methods must not be an empty list",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Glob match for request paths.
///
/// `**` consumes any (possibly empty) run of segments; `*` inside a segment
/// matches any run of characters within that segment.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern_segs: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern_segs, &path_segs)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            (0..=path.len()).any(|skip| match_segments(&pattern[1..], &path[skip..]))
        }
        Some(seg_pattern) => match path.first() {
            Some(seg) => {
                segment_matches(seg_pattern.as_bytes(), seg.as_bytes())
                    && match_segments(&pattern[1..], &path[1..])
            }
            None => false,
        },
    }
}

fn segment_matches(pattern: &[u8], segment: &[u8]) -> bool {
    match pattern.first() {
        None => segment.is_empty(),
        Some(b'*') => (0..=segment.len()).any(|skip| segment_matches(&pattern[1..], &segment[skip..])),
        Some(c) => segment.first() == Some(c) && segment_matches(&pattern[1..], &segment[1..]),
    }
}

/// Ordered collection of rules plus role-keyed default limits.
///
/// Rules are matched in registration order. Updates replace an entry by id;
/// no rule is ever mutated in place.
pub struct RuleRegistry {
    rules: RwLock<Vec<RateLimitRule>>,
    role_defaults: RwLock<HashMap<PlatformRole, u64>>,
}

impl RuleRegistry {
    pub fn new(role_defaults: HashMap<PlatformRole, u64>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            role_defaults: RwLock::new(role_defaults),
        }
    }

    /// Register a rule, replacing any existing rule with the same id in its
    /// original position.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) {
            info!(rule_id = %rule.id, "Replacing rate limit rule");
            *existing = rule;
        } else {
            info!(rule_id = %rule.id, pattern = %rule.path_pattern, "Registered rate limit rule");
            rules.push(rule);
        }
        Ok(())
    }

    /// Remove a rule by id. Returns whether a rule was removed.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    /// All rules applicable to the request, in registration order.
    pub fn find_applicable(
        &self,
        path: &str,
        method: &str,
        role: PlatformRole,
    ) -> Vec<RateLimitRule> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.matches(path, method, role))
            .cloned()
            .collect()
    }

    /// Default requests-per-minute limit for a role, falling back to the
    /// anonymous tier.
    pub fn role_limit(&self, role: PlatformRole) -> u64 {
        let defaults = self.role_defaults.read();
        defaults
            .get(&role)
            .or_else(|| defaults.get(&PlatformRole::Anonymous))
            .copied()
            .unwrap_or(FALLBACK_ANONYMOUS_LIMIT)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Load and register rules from a YAML document of the form
    /// `rules: [...]`.
    pub fn load_yaml(&self, yaml: &str) -> Result<usize> {
        let file: RuleFile = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse rules: {}", e)))?;
        let count = file.rules.len();
        for rule in file.rules {
            self.add_rule(rule)?;
        }
        Ok(count)
    }

    /// Load and register rules from a YAML file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");
        let contents = std::fs::read_to_string(path)?;
        self.load_yaml(&contents)
    }
}

/// On-disk rule file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RateLimitRule>,
}
