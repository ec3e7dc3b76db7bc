// error.rs — Typed adapter failures.
//
// The kind determines the caller's recovery strategy: the deployment
// controller retries `transient` with bounded backoff, surfaces the rest,
// and escalates a failed restore to catastrophic handling.

use thiserror::Error;

/// Failure of a backend adapter operation.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The backend rejected the rule text.
    #[error("backend syntax error: {0}")]
    Syntax(String),

    /// Subprocess or kernel interaction failed.
    #[error("backend system error: {0}")]
    System(String),

    /// The process lacks privileges for the operation.
    #[error("backend permission denied: {0}")]
    Permission(String),

    /// The backend is not present or not answering.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A failure worth retrying (timeout, busy lock).
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Another adapter already owns this kernel subsystem.
    #[error("backend coexistence conflict: {0}")]
    Coexistence(String),
}

impl AdapterError {
    /// Stable kind string for audit records and the service error surface.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Syntax(_) => "syntax",
            AdapterError::System(_) => "system",
            AdapterError::Permission(_) => "permission",
            AdapterError::Unavailable(_) => "unavailable",
            AdapterError::Transient(_) => "transient",
            AdapterError::Coexistence(_) => "coexistence",
        }
    }

    /// Only transient failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}
