//! Composite scope key generation for counter lookup.

/// The dimension a counter is tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    User,
    Ip,
    Organization,
    Global,
    /// The rule's own aggregate limit across all callers
    Rule,
    /// Role-default fallback when no rule matches
    RoleDefault,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::Organization => "org",
            Scope::Global => "global",
            Scope::Rule => "rule",
            Scope::RoleDefault => "role_default",
        }
    }
}

/// A key that uniquely identifies one counter.
///
/// Composed of the owning rule id, the scope dimension, and the identity
/// tracked within that dimension, e.g. `si_integration:user:42`. Ownership of
/// each counter is exclusive to its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub rule_id: String,
    pub scope: Scope,
    pub identity: String,
}

impl ScopeKey {
    pub fn new(rule_id: &str, scope: Scope, identity: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            scope,
            identity: identity.to_string(),
        }
    }

    /// Whether this key tracks the given identity under a per-user or
    /// role-default dimension. Used by the administrative counter reset.
    pub fn tracks_user(&self, user_id: &str) -> bool {
        matches!(self.scope, Scope::User | Scope::RoleDefault) && self.identity == user_id
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.rule_id, self.scope.as_str(), self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ScopeKey::new("si_integration", Scope::User, "42");
        assert_eq!(key.to_string(), "si_integration:user:42");
    }

    #[test]
    fn test_key_equality() {
        let a = ScopeKey::new("r1", Scope::Ip, "10.0.0.1");
        let b = ScopeKey::new("r1", Scope::Ip, "10.0.0.1");
        let c = ScopeKey::new("r1", Scope::User, "10.0.0.1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tracks_user_matches_user_and_default_scopes() {
        assert!(ScopeKey::new("r1", Scope::User, "42").tracks_user("42"));
        assert!(ScopeKey::new("defaults", Scope::RoleDefault, "42").tracks_user("42"));
        assert!(!ScopeKey::new("r1", Scope::Ip, "42").tracks_user("42"));
        assert!(!ScopeKey::new("r1", Scope::User, "7").tracks_user("42"));
    }
}
