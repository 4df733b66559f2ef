//! Configuration management for the admission-control engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::admission::context::PlatformRole;

/// Main configuration for the admission-control engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path prefixes that bypass admission control entirely
    /// (health checks, docs, metrics endpoints).
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    /// Default requests-per-minute limits keyed by platform role,
    /// applied when no rule matches a request.
    #[serde(default = "default_role_limits")]
    pub role_limits: HashMap<PlatformRole, u64>,

    /// Multiplier applied to limits for identities in the priority set.
    #[serde(default = "default_priority_multiplier")]
    pub priority_multiplier: f64,

    /// Adaptive load sampling configuration
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Janitor (stale counter eviction) configuration
    #[serde(default)]
    pub janitor: JanitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            excluded_paths: default_excluded_paths(),
            role_limits: default_role_limits(),
            priority_multiplier: default_priority_multiplier(),
            adaptive: AdaptiveConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }
}

fn default_excluded_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/metrics".to_string(),
        "/docs".to_string(),
    ]
}

fn default_role_limits() -> HashMap<PlatformRole, u64> {
    let mut limits = HashMap::new();
    limits.insert(PlatformRole::Admin, 300);
    limits.insert(PlatformRole::Owner, 180);
    limits.insert(PlatformRole::Member, 120);
    limits.insert(PlatformRole::Integration, 240);
    limits.insert(PlatformRole::Anonymous, 30);
    limits
}

fn default_priority_multiplier() -> f64 {
    2.0
}

/// Adaptive load-sensitive throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// How often the system-load signal is sampled, in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
        }
    }
}

fn default_check_interval() -> u64 {
    60
}

/// Janitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,

    /// Counters idle longer than this are evicted, in seconds
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Whether token buckets are also evicted when idle. They are O(1)
    /// and self-correcting, so eviction is only needed to bound memory
    /// under high key cardinality.
    #[serde(default)]
    pub evict_token_buckets: bool,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
            idle_threshold_secs: default_idle_threshold(),
            evict_token_buckets: false,
        }
    }
}

fn default_janitor_interval() -> u64 {
    300
}

fn default_idle_threshold() -> u64 {
    3600
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::AdmissionError::Config(e.to_string()))?;
        Ok(config)
    }
}
