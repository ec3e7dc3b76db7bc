// model.rs — Proposal and Deployment lifecycle records.
//
// A Proposal is a candidate policy change: the neutral rule, its rendered
// form, the validation verdict, and the conflict report. A Deployment is
// the record of applying one approved proposal. Both carry state machines
// with explicit transition validation:
//
//   Proposal:   draft → pending_approval → approved
//                 (draft | pending_approval) → rejected | superseded
//   Deployment: queued → applying → probation → committed
//                 probation → rolled_back
//                 applying → failed, queued → cancelled
//                 (rollback failure: probation → failed)

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_analyzer::ConflictReport;
use aegis_backend::{BackupRef, RenderedRule, Verdict};
use aegis_policy::PolicyRule;

use crate::error::StoreError;

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Superseded,
}

impl ProposalState {
    pub fn can_transition_to(&self, next: ProposalState) -> bool {
        use ProposalState::*;
        matches!(
            (self, next),
            (Draft, PendingApproval)
                | (Draft, Approved)
                | (Draft, Rejected)
                | (Draft, Superseded)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (PendingApproval, Superseded)
        )
    }

    /// Rejected and superseded proposals never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Rejected | ProposalState::Superseded)
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalState::Draft => "draft",
            ProposalState::PendingApproval => "pending_approval",
            ProposalState::Approved => "approved",
            ProposalState::Rejected => "rejected",
            ProposalState::Superseded => "superseded",
        };
        write!(f, "{}", s)
    }
}

/// A candidate policy change and everything learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub rule: PolicyRule,
    /// Backend text, once rendered by the active adapter.
    pub rendered: Option<RenderedRule>,
    /// Dry-run validation verdict.
    pub verdict: Option<Verdict>,
    /// Conflict analysis against the ruleset at proposal time.
    pub conflicts: Option<ConflictReport>,
    /// Translator explanation, when the proposal came from natural language.
    pub explanation: Option<String>,
    pub state: ProposalState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(rule: PolicyRule) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            rule,
            rendered: None,
            verdict: None,
            conflicts: None,
            explanation: None,
            state: ProposalState::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: ProposalState) -> Result<(), StoreError> {
        if !self.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Approved and waiting for the per-backend lock.
    Queued,
    /// The atomic apply is in flight.
    Applying,
    /// Applied; the heartbeat decides its fate.
    Probation,
    /// Survived probation (or explicitly committed).
    Committed,
    /// Restored to the pre-apply snapshot.
    RolledBack,
    /// Apply failed, or rollback itself failed (operator required).
    Failed,
    /// Cancelled while still queued.
    Cancelled,
}

impl DeploymentState {
    pub fn can_transition_to(&self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Queued, Applying)
                | (Queued, Cancelled)
                | (Applying, Probation)
                | (Applying, Failed)
                | (Probation, Committed)
                | (Probation, RolledBack)
                // Rollback failure strands the deployment for an operator.
                | (Probation, Failed)
        )
    }

    /// Is the deployment still occupying its backend?
    pub fn is_in_flight(&self) -> bool {
        matches!(self, DeploymentState::Applying | DeploymentState::Probation)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Committed
                | DeploymentState::RolledBack
                | DeploymentState::Failed
                | DeploymentState::Cancelled
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentState::Queued => "queued",
            DeploymentState::Applying => "applying",
            DeploymentState::Probation => "probation",
            DeploymentState::Committed => "committed",
            DeploymentState::RolledBack => "rolled_back",
            DeploymentState::Failed => "failed",
            DeploymentState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// The record of applying one approved proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub proposal_id: Uuid,
    /// Backend adapter name this deployment targets.
    pub backend: String,
    pub state: DeploymentState,
    /// Snapshot taken before apply; persisted before apply_atomic runs.
    pub backup: Option<BackupRef>,
    pub applied_at: Option<DateTime<Utc>>,
    pub heartbeat_deadline: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Deployment {
    pub fn new(proposal_id: Uuid, backend: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            backend: backend.into(),
            state: DeploymentState::Queued,
            backup: None,
            applied_at: None,
            heartbeat_deadline: None,
            last_heartbeat_at: None,
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, next: DeploymentState) -> Result<(), StoreError> {
        if !self.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_policy::{Action, RuleOrigin};

    fn rule() -> PolicyRule {
        PolicyRule::builder()
            .action(Action::Drop)
            .source("203.0.113.7/32")
            .unwrap()
            .origin(RuleOrigin::User)
            .build()
            .unwrap()
    }

    #[test]
    fn proposal_lifecycle_happy_path() {
        let mut p = Proposal::new(rule());
        assert_eq!(p.state, ProposalState::Draft);
        p.transition(ProposalState::PendingApproval).unwrap();
        p.transition(ProposalState::Approved).unwrap();
    }

    #[test]
    fn terminal_proposal_states_are_sticky() {
        let mut p = Proposal::new(rule());
        p.transition(ProposalState::Rejected).unwrap();
        assert!(p.state.is_terminal());
        assert!(p.transition(ProposalState::Approved).is_err());
    }

    #[test]
    fn approved_proposal_cannot_be_rejected() {
        let mut p = Proposal::new(rule());
        p.transition(ProposalState::Approved).unwrap();
        assert!(matches!(
            p.transition(ProposalState::Rejected),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn deployment_lifecycle_happy_path() {
        let mut d = Deployment::new(Uuid::new_v4(), "nftables");
        d.transition(DeploymentState::Applying).unwrap();
        assert!(d.state.is_in_flight());
        d.transition(DeploymentState::Probation).unwrap();
        d.transition(DeploymentState::Committed).unwrap();
        assert!(d.state.is_terminal());
    }

    #[test]
    fn heartbeat_miss_path() {
        let mut d = Deployment::new(Uuid::new_v4(), "nftables");
        d.transition(DeploymentState::Applying).unwrap();
        d.transition(DeploymentState::Probation).unwrap();
        d.transition(DeploymentState::RolledBack).unwrap();
    }

    #[test]
    fn cancelled_only_from_queue() {
        let mut d = Deployment::new(Uuid::new_v4(), "nftables");
        d.transition(DeploymentState::Cancelled).unwrap();

        let mut d2 = Deployment::new(Uuid::new_v4(), "nftables");
        d2.transition(DeploymentState::Applying).unwrap();
        assert!(d2.transition(DeploymentState::Cancelled).is_err());
    }

    #[test]
    fn committed_never_rolls_back() {
        let mut d = Deployment::new(Uuid::new_v4(), "nftables");
        d.transition(DeploymentState::Applying).unwrap();
        d.transition(DeploymentState::Probation).unwrap();
        d.transition(DeploymentState::Committed).unwrap();
        assert!(d.transition(DeploymentState::RolledBack).is_err());
    }
}
