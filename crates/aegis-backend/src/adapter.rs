// adapter.rs — The BackendAdapter trait and its wire types.
//
// Everything the deployment controller and facade know about a firewall
// backend goes through this trait. Rendering is pure; validate must not
// touch the live ruleset. apply_atomic is a single kernel transaction: an
// adapter that cannot replace natively must build a full image and load
// it as one transaction, never flush-then-load.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_policy::PolicyRule;

use crate::capabilities::Capabilities;
use crate::error::AdapterError;

/// Backend-specific text for one rule, opaque outside its adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedRule {
    /// Which adapter produced this text.
    pub backend_name: String,
    /// The neutral rule it was rendered from, when known.
    pub rule_id: Option<Uuid>,
    /// Where the backend places the rule (e.g. an nft chain). Adapter-defined.
    pub placement: Option<String>,
    /// The backend's own syntax.
    pub text: String,
}

/// A complete replacement ruleset in the backend's file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetImage {
    pub backend_name: String,
    /// The loadable text, beginning with the backend's flush directive.
    pub text: String,
    /// The rules the image contains, in evaluation order.
    pub rules: Vec<RenderedRule>,
}

impl RuleSetImage {
    /// An image with no rules; applying it atomically flushes.
    pub fn empty(backend_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            text: text.into(),
            rules: Vec::new(),
        }
    }
}

/// Handle to a snapshot usable by `restore`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRef {
    pub id: Uuid,
    pub backend_name: String,
    /// Snapshot file on disk, owned by the deployment controller.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Receipt from a successful mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReceipt {
    pub applied_at: DateTime<Utc>,
    /// Rules now present (full apply) or touched (delta).
    pub rule_count: usize,
    /// True when this was a delta operation.
    pub delta: bool,
}

/// Outcome of a dry-run validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub ok: bool,
    /// Diagnostics and warnings; never silently empty on failure.
    pub messages: Vec<String>,
}

impl Verdict {
    pub fn ok() -> Self {
        Self {
            ok: true,
            messages: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            messages: vec![message.into()],
        }
    }
}

/// Result of lifting the live ruleset into the neutral model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub rules: Vec<PolicyRule>,
    /// Features the adapter could not express neutrally. Never silently
    /// dropped.
    pub warnings: Vec<String>,
}

/// Adapter liveness as seen by the facade and heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Health {
    pub reachable: bool,
    pub writable: bool,
}

/// A single-rule mutation, preferred for autonomous responses because it
/// preserves connection-tracking state.
#[derive(Debug, Clone)]
pub enum DeltaOp {
    Add(RenderedRule),
    Remove(RenderedRule),
}

/// Contract implemented once per firewall backend.
pub trait BackendAdapter: Send + Sync + std::fmt::Debug {
    /// Registry key (e.g. "nftables").
    fn name(&self) -> &str;

    /// The kernel subsystem this adapter drives. Two adapters with the
    /// same subsystem cannot be active together.
    fn kernel_subsystem(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Render one rule to backend text. Pure; no side effects.
    fn render(&self, rule: &PolicyRule) -> Result<RenderedRule, AdapterError>;

    /// Render a full replacement image for the given rules, in evaluation
    /// order. Pure; no side effects.
    fn render_image(&self, rules: &[PolicyRule]) -> Result<RuleSetImage, AdapterError>;

    /// Dry-run check of an image. Must not mutate the live ruleset.
    fn validate(&self, image: &RuleSetImage) -> Result<Verdict, AdapterError>;

    /// Capture the live ruleset in a form `restore` accepts.
    fn snapshot(&self) -> Result<BackupRef, AdapterError>;

    /// Replace the live ruleset in one kernel transaction.
    fn apply_atomic(&self, image: &RuleSetImage) -> Result<ApplyReceipt, AdapterError>;

    /// Add or remove a single rule without disturbing the rest.
    fn apply_delta(&self, op: &DeltaOp) -> Result<ApplyReceipt, AdapterError>;

    /// Atomically restore a snapshot. Returns false if the backup content
    /// no longer exists.
    fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError>;

    /// The active rules, parsed back to text form.
    fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError>;

    /// Best-effort lift of the live ruleset into the neutral model.
    fn import_rules(&self) -> Result<ImportReport, AdapterError>;

    fn health(&self) -> Health;
}
