//! Domain errors for the OpenSkelo execution core.

use thiserror::Error;

/// Domain-level errors.
///
/// Parser errors surface before a run exists and carry messages rather than
/// failure codes; runtime block failures are reported through
/// [`crate::domain::models::FailureInfo`] instead of this enum.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0}")]
    Parse(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DomainError {
    fn from(err: serde_yaml::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
