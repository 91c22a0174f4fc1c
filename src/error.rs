//! Engine error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure modes surfaced by the cohort/progress engine.
///
/// Validation and conflict failures are caller mistakes and are never retried
/// automatically; external-dependency failures leave stored state untouched.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or logically inconsistent input.
    #[error("validation failed on '{field}': {message}")]
    Validation { field: String, message: String },

    /// An invariant would be violated (double membership, double booking).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The actor lacks the required role or relationship.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity exists but is not in the required state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An external collaborator failed or timed out.
    #[error("external dependency failed: {0}")]
    External(String),

    /// Database operation error (wraps sqlx::Error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Stable machine-readable code for structured error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::Conflict(_) => "CONFLICT",
            Self::Authorization(_) => "AUTHORIZATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Precondition(_) => "PRECONDITION",
            Self::External(_) => "EXTERNAL_DEPENDENCY",
            Self::Database(_) => "DATABASE",
        }
    }
}
