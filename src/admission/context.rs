//! Request routing context and admission decision types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Platform role attached to an authenticated request.
///
/// Unknown or absent roles map to [`PlatformRole::Anonymous`], the most
/// restrictive tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformRole {
    Admin,
    Owner,
    Member,
    /// Service-to-service integration credentials
    Integration,
    Anonymous,
}

impl Default for PlatformRole {
    fn default() -> Self {
        PlatformRole::Anonymous
    }
}

impl std::fmt::Display for PlatformRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlatformRole::Admin => "admin",
            PlatformRole::Owner => "owner",
            PlatformRole::Member => "member",
            PlatformRole::Integration => "integration",
            PlatformRole::Anonymous => "anonymous",
        };
        write!(f, "{}", s)
    }
}

/// Routing context produced by the upstream authentication stage.
///
/// Read-only input to the admission engine; the engine never authenticates
/// or mutates it.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub platform_role: PlatformRole,
    pub client_ip: Option<String>,
}

impl RoutingContext {
    /// The identity a counter should be tracked under when no explicit
    /// scope is configured: user id when authenticated, client IP otherwise.
    pub fn identity(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.client_ip.as_deref())
            .unwrap_or("unknown")
    }
}

/// The outcome of evaluating a request against all applicable limits.
///
/// Immutable value returned per request; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests remaining in the most restrictive applicable window
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the quota window resets
    pub reset_time: u64,
    /// How long a denied caller should wait before retrying
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    /// An unconditional allow with no quota accounting, used for excluded
    /// paths and fail-open.
    pub fn bypass(now: u64) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            reset_time: now,
            retry_after: None,
        }
    }

    /// Render the decision as HTTP response headers.
    ///
    /// Allowed requests carry advisory `X-RateLimit-*` headers; denials add
    /// `Retry-After` for the caller to translate into a 429 response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.to_string()),
        ];
        if !self.allowed {
            let secs = self
                .retry_after
                .map(|d| d.as_secs().max(1))
                .unwrap_or(1);
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefers_user_id() {
        let ctx = RoutingContext {
            user_id: Some("42".to_string()),
            client_ip: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert_eq!(ctx.identity(), "42");
    }

    #[test]
    fn test_identity_falls_back_to_ip() {
        let ctx = RoutingContext {
            client_ip: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert_eq!(ctx.identity(), "10.0.0.1");
    }

    #[test]
    fn test_denied_decision_headers() {
        let decision = AdmissionDecision {
            allowed: false,
            remaining: 0,
            reset_time: 1_700_000_060,
            retry_after: Some(Duration::from_secs(30)),
        };
        let headers = decision.headers();
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
        assert!(headers.contains(&("Retry-After", "30".to_string())));
    }

    #[test]
    fn test_allowed_decision_has_no_retry_after() {
        let decision = AdmissionDecision {
            allowed: true,
            remaining: 5,
            reset_time: 1_700_000_060,
            retry_after: None,
        };
        assert!(!decision.headers().iter().any(|(k, _)| *k == "Retry-After"));
    }

    #[test]
    fn test_role_serde_lowercase() {
        let role: PlatformRole = serde_yaml::from_str("admin").unwrap();
        assert_eq!(role, PlatformRole::Admin);
        assert_eq!(serde_yaml::to_string(&PlatformRole::Integration).unwrap().trim(), "integration");
    }
}
