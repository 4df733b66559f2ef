//! Error types for the admission-control engine.

use thiserror::Error;

/// Main error type for admission-control operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors (malformed rule, unknown algorithm)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors during evaluation
    #[error("Counter store error: {0}")]
    Store(String),

    /// System load sampler errors
    #[error("Load sampler error: {0}")]
    LoadSampler(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for admission-control operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
