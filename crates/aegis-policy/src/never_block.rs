// never_block.rs — Subjects the daemon must never firewall.
//
// The never-block list is the last line of defense against self-inflicted
// lockout: management addresses, the control channel, upstream resolvers.
// Autonomous logic consults it before every deployment, and the deployment
// controller re-checks the rendered image against it.
//
// Entries come from three places: operator configuration, hostname
// resolution (cached), and management-address discovery at daemon startup.

use std::net::IpAddr;
use std::net::ToSocketAddrs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::net::IpNet;
use crate::rule::PolicyRule;

/// One protected subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NeverBlockEntry {
    /// A literal address or CIDR.
    Net { net: IpNet, label: String },
    /// A hostname, resolved at load time and cached.
    Host {
        name: String,
        resolved: Vec<IpAddr>,
        resolved_at: Option<DateTime<Utc>>,
    },
    /// A network interface; its addresses are filled in by the daemon's
    /// interface resolver at startup.
    Interface { name: String, resolved: Vec<IpAddr> },
}

impl NeverBlockEntry {
    /// Parse an operator-supplied entry string.
    ///
    /// `iface:` prefixes name an interface; anything that parses as an
    /// address or CIDR is a network; the rest is treated as a hostname.
    pub fn parse(text: &str) -> NeverBlockEntry {
        let text = text.trim();
        if let Some(name) = text.strip_prefix("iface:") {
            return NeverBlockEntry::Interface {
                name: name.to_string(),
                resolved: Vec::new(),
            };
        }
        if let Ok(net) = text.parse::<IpNet>() {
            return NeverBlockEntry::Net {
                net,
                label: text.to_string(),
            };
        }
        NeverBlockEntry::Host {
            name: text.to_string(),
            resolved: Vec::new(),
            resolved_at: None,
        }
    }

    /// The operator-facing spelling of this entry.
    pub fn label(&self) -> String {
        match self {
            NeverBlockEntry::Net { label, .. } => label.clone(),
            NeverBlockEntry::Host { name, .. } => name.clone(),
            NeverBlockEntry::Interface { name, .. } => format!("iface:{}", name),
        }
    }

    /// Does this entry protect the given address?
    pub fn covers_ip(&self, ip: IpAddr) -> bool {
        match self {
            NeverBlockEntry::Net { net, .. } => net.contains(ip),
            NeverBlockEntry::Host { resolved, .. } => resolved.contains(&ip),
            NeverBlockEntry::Interface { resolved, .. } => resolved.contains(&ip),
        }
    }

    /// Would a rule matching `net` touch this entry?
    ///
    /// Any overlap counts: a /16 drop that merely contains a protected /32
    /// is still a violation.
    pub fn intersects_net(&self, net: &IpNet) -> bool {
        match self {
            NeverBlockEntry::Net { net: own, .. } => own.overlaps(net),
            NeverBlockEntry::Host { resolved, .. } => resolved.iter().any(|ip| net.contains(*ip)),
            NeverBlockEntry::Interface { resolved, .. } => {
                resolved.iter().any(|ip| net.contains(*ip))
            }
        }
    }
}

/// The administrator-maintained never-block list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeverBlockList {
    entries: Vec<NeverBlockEntry>,
}

impl NeverBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from operator entry strings (config `never_block.entries`).
    pub fn from_entries<S: AsRef<str>>(texts: &[S]) -> Self {
        Self {
            entries: texts.iter().map(|t| NeverBlockEntry::parse(t.as_ref())).collect(),
        }
    }

    pub fn entries(&self) -> &[NeverBlockEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an entry, ignoring exact duplicates.
    pub fn add(&mut self, entry: NeverBlockEntry) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    /// Add a discovered address (management discovery at startup).
    pub fn add_discovered(&mut self, ip: IpAddr, label: impl Into<String>) {
        self.add(NeverBlockEntry::Net {
            net: IpNet::host(ip),
            label: label.into(),
        });
    }

    /// Remove entries whose label matches; returns how many were removed.
    pub fn remove(&mut self, label: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.label() != label);
        before - self.entries.len()
    }

    /// Resolve all hostname entries through the system resolver, caching
    /// the addresses. Unresolvable hosts are an error: a typo here would
    /// silently disarm the protection.
    pub fn resolve_hosts(&mut self) -> Result<(), PolicyError> {
        let now = Utc::now();
        for entry in &mut self.entries {
            if let NeverBlockEntry::Host {
                name,
                resolved,
                resolved_at,
            } = entry
            {
                let addrs = (name.as_str(), 0u16)
                    .to_socket_addrs()
                    .map_err(|e| PolicyError::UnresolvedHost {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?
                    .map(|sa| sa.ip())
                    .collect::<Vec<_>>();
                if addrs.is_empty() {
                    return Err(PolicyError::UnresolvedHost {
                        name: name.clone(),
                        reason: "no addresses returned".to_string(),
                    });
                }
                *resolved = addrs;
                *resolved_at = Some(now);
            }
        }
        Ok(())
    }

    /// Fill in interface entries using a caller-supplied address lookup.
    /// The daemon supplies one backed by the host's interface tables; tests
    /// supply a fixed map.
    pub fn resolve_interfaces_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Vec<IpAddr>,
    {
        for entry in &mut self.entries {
            if let NeverBlockEntry::Interface { name, resolved } = entry {
                *resolved = lookup(name);
            }
        }
    }

    /// Is the address protected? Returns the matching entry's label.
    pub fn covers_ip(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.covers_ip(ip))
            .map(NeverBlockEntry::label)
    }

    /// Would the rule's source or destination match a protected subject?
    /// Returns the first matching entry's label.
    pub fn blocks_rule(&self, rule: &PolicyRule) -> Option<String> {
        for net in [rule.source_net(), rule.destination_net()].into_iter().flatten() {
            if let Some(label) = self
                .entries
                .iter()
                .find(|e| e.intersects_net(net))
                .map(NeverBlockEntry::label)
            {
                return Some(label);
            }
        }
        None
    }
}
