//! Turnstile - Request Admission Control Engine
//!
//! This crate implements the role-aware, multi-algorithm admission-control
//! stage of an API gateway middleware stack. Given a routing context from an
//! upstream authentication stage, it decides per request whether it may
//! proceed, how much quota remains, and when a rejected caller may retry.
//! Counters live in process memory behind a pluggable store interface.

pub mod admission;
pub mod config;
pub mod error;

pub use admission::{AdmissionDecision, AdmissionEngine, PlatformRole, RoutingContext};
pub use config::EngineConfig;
pub use error::{AdmissionError, Result};
