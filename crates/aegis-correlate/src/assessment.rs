// assessment.rs — ThreatAssessment: the correlator's verdict on a subject.
//
// An assessment is derived state: it names the subject, the kind of
// threat, the evidence window, and a score in 0..1. The autonomy
// controller turns assessments into concrete rules through deterministic
// templates keyed by kind; an assessment itself never carries free-form
// rule text.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The threat kinds the fast path classifies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    /// Repeated authentication failures against one service.
    BruteForce,
    /// Probes across many ports or targets.
    PortScan,
    /// Abnormal traffic volume from one subject.
    RateSpike,
    /// Subject listed by a threat feed.
    FeedHit,
}

impl ThreatKind {
    /// Default block duration for rules templated from this kind.
    pub fn default_ttl(&self) -> chrono::Duration {
        match self {
            ThreatKind::BruteForce => chrono::Duration::hours(24),
            ThreatKind::PortScan => chrono::Duration::hours(1),
            ThreatKind::RateSpike => chrono::Duration::hours(2),
            ThreatKind::FeedHit => chrono::Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::BruteForce => "brute_force",
            ThreatKind::PortScan => "port_scan",
            ThreatKind::RateSpike => "rate_spike",
            ThreatKind::FeedHit => "feed_hit",
        }
    }
}

/// What the correlator thinks should happen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    BlockSubject,
    RateLimit,
    AlertOnly,
}

/// Derived judgment about one subject, backed by an evidence window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub id: Uuid,
    pub kind: ThreatKind,
    pub subject: IpAddr,
    /// 0..1; kind-specific thresholds decide emission.
    pub score: f64,
    pub recommendation: Recommendation,
    /// Ids of the events in the evidence window (bounded).
    pub evidence: Vec<Uuid>,
    /// Distinct targets (ports, users) seen for this subject.
    pub distinct_targets: usize,
    /// Sample of those targets (bounded), for rule templating.
    pub targets: Vec<String>,
    /// Distinct sources that contributed evidence.
    pub distinct_sources: usize,
    /// Suggested expiry for any rule templated from this assessment.
    pub expires_suggestion: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
