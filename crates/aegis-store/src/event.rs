// event.rs — SecurityEvent: one observation from a log source or feed.
//
// Events are immutable once emitted. The causal_tag links an event to the
// deployment whose effect plausibly produced it; the correlator uses it to
// avoid re-escalating the daemon's own side effects.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of event kinds. Exhaustive matching everywhere means adding
/// a kind is a compile-time checklist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Failed authentication attempt (sshd, PAM, ...).
    AuthFail,
    /// A probe consistent with port scanning.
    PortScanHit,
    /// Traffic volume anomaly from one subject.
    RateAnomaly,
    /// A subject listed by a threat feed.
    FeedIndicator,
    /// The firewall dropped a connection (from the backend's own log).
    ConnDrop,
    /// A source shed low-severity events under backpressure; the count
    /// travels in `raw`.
    SourceDrop,
}

impl EventKind {
    /// Stable identifier used in storage and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AuthFail => "auth_fail",
            EventKind::PortScanHit => "port_scan_hit",
            EventKind::RateAnomaly => "rate_anomaly",
            EventKind::FeedIndicator => "feed_indicator",
            EventKind::ConnDrop => "conn_drop",
            EventKind::SourceDrop => "source_drop",
        }
    }
}

/// How urgent an event is. Drives the bus's drop policy: `Critical` is
/// never shed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One immutable security observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub id: Uuid,
    /// Which source produced this (config key, e.g. "sshd").
    pub source_name: String,
    pub kind: EventKind,
    pub severity: Severity,
    /// The offending subject, when one is identifiable.
    pub source_ip: Option<IpAddr>,
    /// What was targeted (port, service, username...).
    pub target: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// Deployment whose effect plausibly caused this event.
    pub causal_tag: Option<Uuid>,
    /// The raw line or payload, kept opaque.
    pub raw: Option<String>,
}

impl SecurityEvent {
    pub fn new(source_name: impl Into<String>, kind: EventKind, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.into(),
            kind,
            severity,
            source_ip: None,
            target: None,
            observed_at: Utc::now(),
            causal_tag: None,
            raw: None,
        }
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_causal_tag(mut self, deployment_id: Uuid) -> Self {
        self.causal_tag = Some(deployment_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = SecurityEvent::new("sshd", EventKind::AuthFail, Severity::Medium)
            .with_source_ip("203.0.113.7".parse().unwrap())
            .with_target("port/22")
            .with_raw("Failed password for root from 203.0.113.7");
        let json = serde_json::to_string(&event).unwrap();
        let back: SecurityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(json.contains("\"auth_fail\""));
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(EventKind::FeedIndicator.as_str(), "feed_indicator");
        assert_eq!(EventKind::SourceDrop.as_str(), "source_drop");
    }
}
