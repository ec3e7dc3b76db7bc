// rule.rs — PolicyRule: backend-neutral firewall intent.
//
// A PolicyRule says WHAT to match and WHAT to do about it, in terms every
// backend understands. It never contains backend syntax; rendering is an
// adapter concern. The match fields define dedup equality: two rules are
// the same rule iff every match field is equal after canonicalization.
//
// Invariant: `action = accept` is reserved for operator-authored rules.
// Autonomous logic may only drop or reject.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;
use crate::net::IpNet;
use crate::ports::PortSpec;

/// Which IP family a rule applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Ipv4,
    Ipv6,
    Both,
}

/// Traffic direction relative to this host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
    Forward,
}

/// What to do with matching traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Drop,
    Reject,
    Accept,
}

/// Transport protocol to match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl Protocol {
    /// Only TCP and UDP carry port numbers.
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Where a rule came from. Drives the safety gates: autonomous rules are
/// held to stricter invariants than operator rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    /// Authored by an operator through the service API.
    User,
    /// Created and applied by the daemon on its own authority.
    DaemonAuto,
    /// Created by the daemon but queued for operator approval.
    DaemonPropose,
    /// Lifted from a live ruleset the daemon did not create.
    Imported,
}

/// An address match: a concrete network or a named set the backend owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AddrSpec {
    /// Concrete address or CIDR.
    Net(IpNet),
    /// Symbolic set resolved by the backend (e.g. an nft named set).
    Set(String),
}

impl AddrSpec {
    /// The concrete network, if this is not a symbolic set.
    pub fn as_net(&self) -> Option<&IpNet> {
        match self {
            AddrSpec::Net(net) => Some(net),
            AddrSpec::Set(_) => None,
        }
    }
}

/// Token-bucket style rate limit: at most `count` matches per `per_secs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub count: u32,
    pub per_secs: u32,
}

impl RateLimit {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.count == 0 || self.per_secs == 0 {
            return Err(PolicyError::InvalidRate);
        }
        Ok(())
    }
}

/// A backend-neutral firewall rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    /// Unique, immutable identifier.
    pub id: Uuid,
    /// IP family this rule applies to.
    pub family: Family,
    /// Traffic direction.
    pub direction: Direction,
    /// Verdict for matching traffic.
    pub action: Action,
    /// Source address match (absent = any source).
    pub source: Option<AddrSpec>,
    /// Destination address match (absent = any destination).
    pub destination: Option<AddrSpec>,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Source port match (TCP/UDP only).
    pub source_port: Option<PortSpec>,
    /// Destination port match (TCP/UDP only).
    pub destination_port: Option<PortSpec>,
    /// Whether the rule participates in connection tracking.
    pub stateful: bool,
    /// Optional rate limit on matches.
    pub rate_limit: Option<RateLimit>,
    /// Emit a log record for matching packets.
    pub log: bool,
    /// Evaluation priority; lower sorts earlier.
    pub priority: i32,
    /// When the rule stops applying (enforced by the deployment controller).
    pub expires_at: Option<DateTime<Utc>>,
    /// Who authored the rule.
    pub origin: RuleOrigin,
    /// Free text carried into the backend; escape-safe by validation.
    pub comment: String,
}

impl PolicyRule {
    /// Start building a rule. Defaults: `family = both`, `direction = input`,
    /// `action = drop`, `protocol = any`, `priority = 0`.
    pub fn builder() -> PolicyRuleBuilder {
        PolicyRuleBuilder::default()
    }

    /// Validate every field; called by the builder and again by the facade
    /// before rendering.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.action == Action::Accept && self.origin != RuleOrigin::User {
            return Err(PolicyError::AcceptRequiresOperator(self.origin.to_string()));
        }

        if !self.protocol.has_ports() && (self.source_port.is_some() || self.destination_port.is_some())
        {
            return Err(PolicyError::PortsWithoutPorts(format!("{}", self.protocol)));
        }
        if let Some(spec) = &self.source_port {
            spec.validate()?;
        }
        if let Some(spec) = &self.destination_port {
            spec.validate()?;
        }
        if let Some(rate) = &self.rate_limit {
            rate.validate()?;
        }

        for c in self.comment.chars() {
            if c.is_control() || c == '"' {
                return Err(PolicyError::ForbiddenCommentChar(c));
            }
        }

        self.check_families()
    }

    // Address families must agree with each other and with an explicit
    // rule family. `family = both` with a concrete address is fine: the
    // rule simply only matches traffic of that address family.
    fn check_families(&self) -> Result<(), PolicyError> {
        let src_v4 = self.source.as_ref().and_then(AddrSpec::as_net).map(IpNet::is_ipv4);
        let dst_v4 = self
            .destination
            .as_ref()
            .and_then(AddrSpec::as_net)
            .map(IpNet::is_ipv4);

        if let (Some(s), Some(d)) = (src_v4, dst_v4) {
            if s != d {
                return Err(PolicyError::FamilyMismatch(
                    "source and destination are different families".to_string(),
                ));
            }
        }
        let addr_v4 = src_v4.or(dst_v4);
        match (self.family, addr_v4) {
            (Family::Ipv4, Some(false)) => Err(PolicyError::FamilyMismatch(
                "ipv4 rule with an IPv6 address".to_string(),
            )),
            (Family::Ipv6, Some(true)) => Err(PolicyError::FamilyMismatch(
                "ipv6 rule with an IPv4 address".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Canonical form: port specs sorted/collapsed, comment trimmed.
    /// CIDRs are canonical by construction.
    pub fn canonical(&self) -> PolicyRule {
        let mut rule = self.clone();
        rule.source_port = rule.source_port.map(|s| s.canonical());
        rule.destination_port = rule.destination_port.map(|s| s.canonical());
        rule.comment = rule.comment.trim().to_string();
        rule
    }

    /// Dedup equality: every match field equal after canonicalization.
    /// Action, logging, priority, expiry, origin, and comment do not
    /// distinguish rules for dedup purposes.
    pub fn same_match(&self, other: &PolicyRule) -> bool {
        let a = self.canonical();
        let b = other.canonical();
        a.family == b.family
            && a.direction == b.direction
            && a.source == b.source
            && a.destination == b.destination
            && a.protocol == b.protocol
            && a.source_port == b.source_port
            && a.destination_port == b.destination_port
            && a.stateful == b.stateful
            && a.rate_limit == b.rate_limit
    }

    /// The concrete source network, if one is set.
    pub fn source_net(&self) -> Option<&IpNet> {
        self.source.as_ref().and_then(AddrSpec::as_net)
    }

    /// The concrete destination network, if one is set.
    pub fn destination_net(&self) -> Option<&IpNet> {
        self.destination.as_ref().and_then(AddrSpec::as_net)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Any => write!(f, "any"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Drop => write!(f, "drop"),
            Action::Reject => write!(f, "reject"),
            Action::Accept => write!(f, "accept"),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
            Direction::Forward => write!(f, "forward"),
        }
    }
}

impl fmt::Display for RuleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleOrigin::User => write!(f, "user"),
            RuleOrigin::DaemonAuto => write!(f, "daemon-auto"),
            RuleOrigin::DaemonPropose => write!(f, "daemon-propose"),
            RuleOrigin::Imported => write!(f, "imported"),
        }
    }
}

/// Builder for [`PolicyRule`]. `build()` validates the result.
#[derive(Debug, Clone)]
pub struct PolicyRuleBuilder {
    family: Family,
    direction: Direction,
    action: Action,
    source: Option<AddrSpec>,
    destination: Option<AddrSpec>,
    protocol: Protocol,
    source_port: Option<PortSpec>,
    destination_port: Option<PortSpec>,
    stateful: Option<bool>,
    rate_limit: Option<RateLimit>,
    log: bool,
    priority: i32,
    expires_at: Option<DateTime<Utc>>,
    origin: RuleOrigin,
    comment: String,
}

impl Default for PolicyRuleBuilder {
    fn default() -> Self {
        Self {
            family: Family::Both,
            direction: Direction::Input,
            action: Action::Drop,
            source: None,
            destination: None,
            protocol: Protocol::Any,
            source_port: None,
            destination_port: None,
            stateful: None,
            rate_limit: None,
            log: false,
            priority: 0,
            expires_at: None,
            origin: RuleOrigin::User,
            comment: String::new(),
        }
    }
}

impl PolicyRuleBuilder {
    pub fn family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Parse and set the source address/CIDR.
    pub fn source(mut self, cidr: &str) -> Result<Self, PolicyError> {
        self.source = Some(AddrSpec::Net(cidr.parse()?));
        Ok(self)
    }

    pub fn source_net(mut self, net: IpNet) -> Self {
        self.source = Some(AddrSpec::Net(net));
        self
    }

    pub fn source_set(mut self, name: impl Into<String>) -> Self {
        self.source = Some(AddrSpec::Set(name.into()));
        self
    }

    /// Parse and set the destination address/CIDR.
    pub fn destination(mut self, cidr: &str) -> Result<Self, PolicyError> {
        self.destination = Some(AddrSpec::Net(cidr.parse()?));
        Ok(self)
    }

    pub fn destination_net(mut self, net: IpNet) -> Self {
        self.destination = Some(AddrSpec::Net(net));
        self
    }

    pub fn destination_set(mut self, name: impl Into<String>) -> Self {
        self.destination = Some(AddrSpec::Set(name.into()));
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn source_port(mut self, spec: impl Into<PortSpec>) -> Self {
        self.source_port = Some(spec.into());
        self
    }

    pub fn destination_port(mut self, spec: impl Into<PortSpec>) -> Self {
        self.destination_port = Some(spec.into());
        self
    }

    pub fn stateful(mut self, stateful: bool) -> Self {
        self.stateful = Some(stateful);
        self
    }

    pub fn rate_limit(mut self, count: u32, per_secs: u32) -> Self {
        self.rate_limit = Some(RateLimit { count, per_secs });
        self
    }

    pub fn log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expires_at(mut self, when: DateTime<Utc>) -> Self {
        self.expires_at = Some(when);
        self
    }

    pub fn origin(mut self, origin: RuleOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Finish and validate. Statefulness defaults to true for accept rules
    /// and false otherwise, unless set explicitly.
    pub fn build(self) -> Result<PolicyRule, PolicyError> {
        let stateful = self.stateful.unwrap_or(self.action == Action::Accept);
        let rule = PolicyRule {
            id: Uuid::new_v4(),
            family: self.family,
            direction: self.direction,
            action: self.action,
            source: self.source,
            destination: self.destination,
            protocol: self.protocol,
            source_port: self.source_port,
            destination_port: self.destination_port,
            stateful,
            rate_limit: self.rate_limit,
            log: self.log,
            priority: self.priority,
            expires_at: self.expires_at,
            origin: self.origin,
            comment: self.comment,
        };
        rule.validate()?;
        Ok(rule)
    }
}
