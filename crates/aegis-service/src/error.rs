// error.rs — The stable error surface.
//
// Consumers see exactly one error shape: a kind from the fixed taxonomy,
// a human message, and an optional correlation id tying the failure to
// audit records. Internal errors are mapped here at the boundary; nothing
// opaque crosses it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_autonomy::AutonomyError;
use aegis_backend::AdapterError;
use aegis_deploy::DeployError;
use aegis_policy::PolicyError;
use aegis_store::StoreError;

/// The error taxonomy consumers program against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed rule, unsupported capability, conflicting fields.
    Validation,
    /// Never-block match, gate failure, management self-block.
    PolicyViolation,
    /// Backend adapter failure; the adapter kind travels in the message.
    Adapter,
    /// Lock timeout or queue overflow.
    Concurrency,
    /// Probation deadline elapsed with a failing probe.
    HeartbeatMiss,
    /// Store constraint violation, missing backup.
    Integrity,
    /// Rollback itself failed; operator attention required.
    Catastrophic,
    /// Entity lookup found nothing.
    NotFound,
    /// Anything else; should not normally escape.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::Adapter => "adapter",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::HeartbeatMiss => "heartbeat_miss",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Catastrophic => "catastrophic",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

/// The one error type the facade returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
    /// Ties the failure to related audit records, when one exists.
    pub correlation_id: Option<Uuid>,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ServiceError {}

impl From<PolicyError> for ServiceError {
    fn from(err: PolicyError) -> Self {
        ServiceError::new(ErrorKind::Validation, err.to_string())
    }
}

impl From<AdapterError> for ServiceError {
    fn from(err: AdapterError) -> Self {
        ServiceError::new(ErrorKind::Adapter, format!("{}: {}", err.kind(), err))
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::new(ErrorKind::NotFound, what),
            invalid @ StoreError::InvalidTransition { .. } => {
                ServiceError::new(ErrorKind::Validation, invalid.to_string())
            }
            other => ServiceError::new(ErrorKind::Integrity, other.to_string()),
        }
    }
}

impl From<DeployError> for ServiceError {
    fn from(err: DeployError) -> Self {
        let kind = match &err {
            DeployError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            DeployError::Adapter(_) => ErrorKind::Adapter,
            DeployError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            DeployError::Store(_) => ErrorKind::Integrity,
            DeployError::LockTimeout => ErrorKind::Concurrency,
            DeployError::InvalidState { .. } => ErrorKind::Validation,
            DeployError::Catastrophic(_) => ErrorKind::Catastrophic,
        };
        ServiceError::new(kind, err.to_string())
    }
}

impl From<AutonomyError> for ServiceError {
    fn from(err: AutonomyError) -> Self {
        match err {
            AutonomyError::Store(e) => e.into(),
            AutonomyError::Deploy(e) => e.into(),
            AutonomyError::Template(e) => e.into(),
        }
    }
}
