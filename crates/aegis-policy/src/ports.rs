// ports.rs — Port specifications.
//
// A rule matches a single port, a contiguous range, or an explicit list.
// The three shapes are a tagged enum, so a rule can never carry both a
// list and a range for the same side. Canonical form sorts and dedups
// lists and collapses degenerate shapes, so equal match sets compare equal.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Ports matched by one side (source or destination) of a rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortSpec {
    /// Exactly one port.
    Single(u16),
    /// An inclusive range.
    Range { start: u16, end: u16 },
    /// An explicit list of ports.
    List(Vec<u16>),
}

impl PortSpec {
    /// Check port bounds: every port in 1..=65535, ranges ordered,
    /// lists non-empty.
    pub fn validate(&self) -> Result<(), PolicyError> {
        match self {
            PortSpec::Single(p) => {
                if *p == 0 {
                    return Err(PolicyError::InvalidPort("port 0".to_string()));
                }
            }
            PortSpec::Range { start, end } => {
                if *start == 0 || *end == 0 {
                    return Err(PolicyError::InvalidPort("port 0".to_string()));
                }
                if start > end {
                    return Err(PolicyError::InvalidPort(format!(
                        "reversed range {}-{}",
                        start, end
                    )));
                }
            }
            PortSpec::List(ports) => {
                if ports.is_empty() {
                    return Err(PolicyError::EmptyPortList);
                }
                if ports.iter().any(|p| *p == 0) {
                    return Err(PolicyError::InvalidPort("port 0".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Canonical form: lists sorted and deduplicated, one-element lists
    /// and one-port ranges collapsed to `Single`.
    pub fn canonical(&self) -> PortSpec {
        match self {
            PortSpec::Single(p) => PortSpec::Single(*p),
            PortSpec::Range { start, end } if start == end => PortSpec::Single(*start),
            PortSpec::Range { start, end } => PortSpec::Range {
                start: *start,
                end: *end,
            },
            PortSpec::List(ports) => {
                let mut sorted = ports.clone();
                sorted.sort_unstable();
                sorted.dedup();
                if sorted.len() == 1 {
                    PortSpec::Single(sorted[0])
                } else {
                    PortSpec::List(sorted)
                }
            }
        }
    }

    /// Sorted, merged inclusive intervals covering this spec.
    ///
    /// The conflict analyzer intersects these to decide overlap and
    /// containment.
    pub fn intervals(&self) -> Vec<(u16, u16)> {
        match self.canonical() {
            PortSpec::Single(p) => vec![(p, p)],
            PortSpec::Range { start, end } => vec![(start, end)],
            PortSpec::List(ports) => {
                let mut out: Vec<(u16, u16)> = Vec::new();
                for p in ports {
                    match out.last_mut() {
                        Some((_, end)) if *end != u16::MAX && p == *end + 1 => *end = p,
                        Some((_, end)) if p <= *end => {}
                        _ => out.push((p, p)),
                    }
                }
                out
            }
        }
    }

    /// Does this spec match the given port?
    pub fn contains(&self, port: u16) -> bool {
        self.intervals()
            .iter()
            .any(|(start, end)| (*start..=*end).contains(&port))
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Single(port)
    }
}
