// audit.rs — Audit record model and hash chaining.
//
// Every transition in the system appends exactly one audit record. Records
// are hash-chained: each carries the SHA-256 of the previous record's
// content, so insertion, deletion, or modification anywhere in the trail
// is detectable. The sequence id is assigned by the store and is gapless
// and monotonic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Everything that gets audited. One variant per transition kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProposalCreated,
    ProposalApproved,
    ProposalRejected,
    ProposalSuperseded,
    DeploymentQueued,
    DeploymentApplying,
    DeploymentApplied,
    DeploymentCommitted,
    DeploymentRolledBack,
    DeploymentFailed,
    DeploymentCancelled,
    HeartbeatMiss,
    RollbackOk,
    /// Rollback itself failed; operator attention required.
    Catastrophic,
    EventObserved,
    /// A source shed low-severity events under backpressure.
    EventsDropped,
    ThreatEscalated,
    AutonomousApplied,
    AutonomySuppressed,
    BreakerTripped,
    BreakerReset,
    AutonomyLevelChanged,
    NeverBlockAdded,
    NeverBlockRemoved,
    SourceRestarted,
    ConfigReloaded,
    /// An expired autonomous rule was removed from the live ruleset.
    RuleExpired,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ProposalCreated => "proposal_created",
            AuditAction::ProposalApproved => "proposal_approved",
            AuditAction::ProposalRejected => "proposal_rejected",
            AuditAction::ProposalSuperseded => "proposal_superseded",
            AuditAction::DeploymentQueued => "deployment_queued",
            AuditAction::DeploymentApplying => "deployment_applying",
            AuditAction::DeploymentApplied => "deployment_applied",
            AuditAction::DeploymentCommitted => "deployment_committed",
            AuditAction::DeploymentRolledBack => "deployment_rolled_back",
            AuditAction::DeploymentFailed => "deployment_failed",
            AuditAction::DeploymentCancelled => "deployment_cancelled",
            AuditAction::HeartbeatMiss => "heartbeat_miss",
            AuditAction::RollbackOk => "rollback_ok",
            AuditAction::Catastrophic => "catastrophic",
            AuditAction::EventObserved => "event_observed",
            AuditAction::EventsDropped => "events_dropped",
            AuditAction::ThreatEscalated => "threat_escalated",
            AuditAction::AutonomousApplied => "autonomous_applied",
            AuditAction::AutonomySuppressed => "autonomy_suppressed",
            AuditAction::BreakerTripped => "breaker_tripped",
            AuditAction::BreakerReset => "breaker_reset",
            AuditAction::AutonomyLevelChanged => "autonomy_level_changed",
            AuditAction::NeverBlockAdded => "never_block_added",
            AuditAction::NeverBlockRemoved => "never_block_removed",
            AuditAction::SourceRestarted => "source_restarted",
            AuditAction::ConfigReloaded => "config_reloaded",
            AuditAction::RuleExpired => "rule_expired",
        }
    }
}

/// One audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Store-assigned, gapless, monotonic.
    pub seq: i64,
    pub at: DateTime<Utc>,
    /// Who acted: "operator", "daemon", "controller", a source name...
    pub actor: String,
    pub action: AuditAction,
    /// The entity this record is about (proposal/deployment/event id...).
    pub subject_id: Option<String>,
    /// Error kind for failing transitions.
    pub error_kind: Option<String>,
    /// Structured context (assessment ids, reasons, counts).
    pub detail: serde_json::Value,
    /// Hash of the previous record; None for the first record.
    pub prev_hash: Option<String>,
    /// SHA-256 over this record's content and prev_hash.
    pub hash: String,
}

/// Compute the chain hash for a record's content.
pub fn chain_hash(
    at: &DateTime<Utc>,
    actor: &str,
    action: AuditAction,
    subject_id: Option<&str>,
    error_kind: Option<&str>,
    detail: &serde_json::Value,
    prev_hash: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(at.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(actor.as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(subject_id.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(error_kind.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(detail.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}
