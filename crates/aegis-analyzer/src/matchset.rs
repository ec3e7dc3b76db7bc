// matchset.rs — The match-set algebra.
//
// Every rule constrains a handful of dimensions: family, direction,
// source/destination address sets, protocol, source/destination ports,
// statefulness, rate. Two rules overlap iff every dimension's intersection
// is non-empty; one subsumes the other iff it is a superset in every
// dimension. Address sets are CIDR containment; port sets are sorted
// inclusive interval lists.

use aegis_policy::{AddrSpec, Direction, Family, IpNet, PolicyRule, Protocol};

/// One side's address constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum AddrDim {
    /// No constraint: matches every address.
    Any,
    /// A concrete network.
    Net(IpNet),
    /// A backend-resolved named set. Compared nominally: two named sets
    /// relate only when they are the same set.
    Named(String),
}

impl AddrDim {
    fn from_spec(spec: Option<&AddrSpec>) -> Self {
        match spec {
            None => AddrDim::Any,
            Some(AddrSpec::Net(net)) => AddrDim::Net(*net),
            Some(AddrSpec::Set(name)) => AddrDim::Named(name.clone()),
        }
    }

    fn intersects(&self, other: &AddrDim) -> bool {
        match (self, other) {
            (AddrDim::Any, _) | (_, AddrDim::Any) => true,
            (AddrDim::Net(a), AddrDim::Net(b)) => a.overlaps(b),
            (AddrDim::Named(a), AddrDim::Named(b)) => a == b,
            // A named set's membership is unknown here; assume disjoint
            // rather than invent conflicts.
            (AddrDim::Named(_), AddrDim::Net(_)) | (AddrDim::Net(_), AddrDim::Named(_)) => false,
        }
    }

    /// Is `self` a superset of `other`?
    fn contains(&self, other: &AddrDim) -> bool {
        match (self, other) {
            (AddrDim::Any, _) => true,
            (_, AddrDim::Any) => false,
            (AddrDim::Net(a), AddrDim::Net(b)) => a.contains_net(b),
            (AddrDim::Named(a), AddrDim::Named(b)) => a == b,
            _ => false,
        }
    }
}

/// Port constraint as sorted inclusive intervals; `None` = all ports.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDim(Option<Vec<(u16, u16)>>);

impl PortDim {
    fn from_rule(spec: Option<&aegis_policy::PortSpec>) -> Self {
        PortDim(spec.map(|s| s.intervals()))
    }

    fn intersects(&self, other: &PortDim) -> bool {
        match (&self.0, &other.0) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a
                .iter()
                .any(|(s1, e1)| b.iter().any(|(s2, e2)| s1 <= e2 && s2 <= e1)),
        }
    }

    fn contains(&self, other: &PortDim) -> bool {
        match (&self.0, &other.0) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b
                .iter()
                .all(|(s2, e2)| a.iter().any(|(s1, e1)| s1 <= s2 && e2 <= e1)),
        }
    }
}

/// The full match set of one rule.
#[derive(Debug, Clone)]
pub struct MatchSet {
    direction: Direction,
    /// Effective families after address narrowing: (matches_v4, matches_v6).
    families: (bool, bool),
    source: AddrDim,
    destination: AddrDim,
    protocols: Vec<Protocol>,
    source_ports: PortDim,
    destination_ports: PortDim,
    /// `true` restricts the rule to new connections, a subset of all traffic.
    stateful: bool,
    /// A rate limit restricts matches to a subset of the unlimited set.
    rate_limited: bool,
}

impl MatchSet {
    pub fn of(rule: &PolicyRule) -> Self {
        let rule = rule.canonical();
        let addr_v4 = rule
            .source_net()
            .or(rule.destination_net())
            .map(IpNet::is_ipv4);
        let families = match (rule.family, addr_v4) {
            (_, Some(true)) => (true, false),
            (_, Some(false)) => (false, true),
            (Family::Ipv4, None) => (true, false),
            (Family::Ipv6, None) => (false, true),
            (Family::Both, None) => (true, true),
        };
        let protocols = match rule.protocol {
            Protocol::Any => vec![Protocol::Tcp, Protocol::Udp, Protocol::Icmp],
            p => vec![p],
        };
        Self {
            direction: rule.direction,
            families,
            source: AddrDim::from_spec(rule.source.as_ref()),
            destination: AddrDim::from_spec(rule.destination.as_ref()),
            protocols,
            source_ports: PortDim::from_rule(rule.source_port.as_ref()),
            destination_ports: PortDim::from_rule(rule.destination_port.as_ref()),
            stateful: rule.stateful,
            rate_limited: rule.rate_limit.is_some(),
        }
    }

    /// Non-empty intersection across every dimension.
    pub fn overlaps(&self, other: &MatchSet) -> bool {
        self.direction == other.direction
            && ((self.families.0 && other.families.0) || (self.families.1 && other.families.1))
            && self.source.intersects(&other.source)
            && self.destination.intersects(&other.destination)
            && self.protocols.iter().any(|p| other.protocols.contains(p))
            && self.source_ports.intersects(&other.source_ports)
            && self.destination_ports.intersects(&other.destination_ports)
        // Statefulness and rate limits narrow a rule but never empty the
        // intersection: new connections are traffic too.
    }

    /// Is `self` a superset of `other` in every dimension?
    pub fn contains(&self, other: &MatchSet) -> bool {
        self.direction == other.direction
            && (other.families.0 <= self.families.0)
            && (other.families.1 <= self.families.1)
            && self.source.contains(&other.source)
            && self.destination.contains(&other.destination)
            && other.protocols.iter().all(|p| self.protocols.contains(p))
            && self.source_ports.contains(&other.source_ports)
            && self.destination_ports.contains(&other.destination_ports)
            // An unconstrained rule contains a stateful/rate-limited one,
            // not the other way around.
            && (!self.stateful || other.stateful)
            && (!self.rate_limited || other.rate_limited)
    }
}
