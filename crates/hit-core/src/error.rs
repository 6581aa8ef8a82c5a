//! Domain and collaborator error types.

use thiserror::Error;

/// Errors raised while constructing or validating domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Counter key failed validation
    #[error("Invalid counter key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors returned by external collaborators (counter store, rate limiter,
/// badge renderer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("counter store error: {0}")]
    Counter(String),

    #[error("rate limiter error: {0}")]
    Limiter(String),

    #[error("badge render error: {0}")]
    Render(String),
}
