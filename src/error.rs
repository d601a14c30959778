//! Domain error types.
//!
//! `BrokerError` classifies failures into the kinds enumerated in the
//! error-handling design: validation, auth, authorization, not-found,
//! transient, and fatal. Callers that need to decide whether to retry or
//! give up branch on [`BrokerError::is_transient`] rather than matching on
//! the underlying `sqlx`/`reqwest` error, which keeps the retry helper in
//! [`crate::util::retry`] backend-agnostic.

use thiserror::Error;

/// Convenience alias used across the dispatch/lifecycle core.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed input: bad ids, missing required fields.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Bad secret key, bad webhook signature, expired timestamp.
    #[error("unauthorized")]
    Unauthorized,

    /// Entity not found, or found but in another organization (treated
    /// identically to avoid leaking cross-org existence).
    #[error("not found")]
    NotFound,

    /// A uniqueness/at-most-one invariant would be violated by this write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Datastore deadlock, chat-platform 5xx/429: safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A corrupted invariant was observed (e.g. two IN_PROGRESS messages on
    /// one job). Never auto-healed; surfaced for an operator to inspect.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// True for failure kinds the retry helper should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    /// Authorization failures are reported as not-found to avoid leaking
    /// cross-org existence, per the error-handling design.
    pub fn cross_org() -> Self {
        BrokerError::NotFound
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => BrokerError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                BrokerError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) if is_serialization_failure(db_err.code().as_deref()) => {
                BrokerError::Transient(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => BrokerError::Transient(err.to_string()),
            other => BrokerError::Transient(other.to_string()),
        }
    }
}

impl From<crate::ids::IdError> for BrokerError {
    fn from(err: crate::ids::IdError) -> Self {
        BrokerError::Validation(err.to_string())
    }
}

/// Postgres serialization/deadlock SQLSTATEs that warrant a retry.
fn is_serialization_failure(code: Option<&str>) -> bool {
    matches!(code, Some("40001") | Some("40P01"))
}

/// Joins several errors from an independent-pass loop (periodic tasks) into
/// one reportable error without losing the individual failures, matching
/// the "accumulate, don't halt the pass" policy for C7 sweeps.
#[derive(Debug, Default)]
pub struct MultiError(pub Vec<BrokerError>);

impl MultiError {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error(s) during pass: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
