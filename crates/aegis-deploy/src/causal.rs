// causal.rs — Causal window publication.
//
// When a deployment lands, the controller announces what it just did:
// which subject, which event kinds the change can now produce, and for
// how long. Log sources stamp matching events with the deployment id, and
// the correlator refuses to re-score a subject inside such a window.
// This is the mechanism that stops the daemon escalating its own side
// effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_policy::IpNet;
use aegis_store::EventKind;

/// "Events like this, from this subject, until this time, are mine."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalWindow {
    pub deployment_id: Uuid,
    /// The subject the deployment acted on; None for ruleset-wide changes.
    pub subject: Option<IpNet>,
    /// Event kinds the change plausibly produces.
    pub kinds: Vec<EventKind>,
    pub valid_until: DateTime<Utc>,
}

impl CausalWindow {
    /// Does an observation fall inside this window?
    pub fn matches(&self, ip: Option<std::net::IpAddr>, kind: EventKind, at: DateTime<Utc>) -> bool {
        if at > self.valid_until || !self.kinds.contains(&kind) {
            return false;
        }
        match (&self.subject, ip) {
            (None, _) => true,
            (Some(net), Some(ip)) => net.contains(ip),
            (Some(_), None) => false,
        }
    }
}

/// Receiver of causal windows; the event bus implements this.
pub trait CausalSink: Send + Sync {
    fn publish(&self, window: CausalWindow);
}
