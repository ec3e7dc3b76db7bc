// error.rs — Store error types.

use thiserror::Error;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row lookup that found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint or invariant violation (e.g. second deployment for a
    /// proposal, broken audit chain).
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Invalid lifecycle transition.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}
