// error.rs — Deployment controller errors.

use thiserror::Error;

use aegis_backend::AdapterError;
use aegis_store::StoreError;

/// Failures surfaced by the deployment controller.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The rendered rule matches a never-block subject.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Backend adapter failure (after transient retries were exhausted).
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Could not acquire the per-backend lock in time.
    #[error("timed out waiting for the backend lock")]
    LockTimeout,

    /// The deployment is not in a state that allows the operation.
    #[error("deployment {id} is {state}; cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: &'static str,
    },

    /// Rollback itself failed. Operator attention required; autonomous
    /// action is disabled until reset.
    #[error("catastrophic: rollback failed: {0}")]
    Catastrophic(String),
}

impl DeployError {
    /// Stable kind string for audit records and the service surface.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::PolicyViolation(_) => "policy_violation",
            DeployError::Adapter(e) => e.kind(),
            DeployError::Store(_) => "integrity",
            DeployError::LockTimeout => "lock_timeout",
            DeployError::InvalidState { .. } => "invalid_state",
            DeployError::Catastrophic(_) => "catastrophic",
        }
    }
}
