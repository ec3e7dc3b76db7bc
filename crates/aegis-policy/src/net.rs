// net.rs — CIDR handling for the rule model.
//
// IpNet is the single address-set primitive used across Aegis: rule
// source/destination matches, never-block entries, and the conflict
// analyzer's containment checks all speak IpNet. Host bits are masked off
// at construction so two spellings of the same network compare equal.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// An IPv4 or IPv6 network in CIDR form, stored canonicalized.
///
/// Serializes as its display string ("203.0.113.0/24") so stored rules
/// stay human-readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    /// Build a network from an address and prefix length, masking host bits.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, PolicyError> {
        let max = Self::family_bits(&addr);
        if prefix > max {
            return Err(PolicyError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        let masked = from_bits(mask_bits(to_bits(addr), prefix, max), addr.is_ipv4());
        Ok(Self {
            addr: masked,
            prefix,
        })
    }

    /// A single-host network (/32 or /128).
    pub fn host(addr: IpAddr) -> Self {
        let prefix = Self::family_bits(&addr);
        Self { addr, prefix }
    }

    /// The (masked) network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// True for IPv4 networks.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// First address of the network (== the network address).
    pub fn first(&self) -> IpAddr {
        self.addr
    }

    /// Last address of the network (broadcast for IPv4).
    pub fn last(&self) -> IpAddr {
        let max = Self::family_bits(&self.addr);
        let host_bits = max - self.prefix;
        let fill = low_bits(host_bits);
        from_bits(to_bits(self.addr) | fill, self.addr.is_ipv4())
    }

    /// Does this network contain the given address?
    ///
    /// Addresses of the other family never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.addr.is_ipv4() {
            return false;
        }
        let max = Self::family_bits(&self.addr);
        mask_bits(to_bits(ip), self.prefix, max) == to_bits(self.addr)
    }

    /// Does this network fully contain `other`?
    pub fn contains_net(&self, other: &IpNet) -> bool {
        other.prefix >= self.prefix && self.contains(other.addr)
    }

    /// Do the two networks share any address?
    pub fn overlaps(&self, other: &IpNet) -> bool {
        self.contains_net(other) || other.contains_net(self)
    }

    /// True when this network covers strictly more addresses than a
    /// `max_prefix`-sized network of the same family would.
    pub fn broader_than(&self, max_prefix: u8) -> bool {
        self.prefix < max_prefix
    }

    fn family_bits(addr: &IpAddr) -> u8 {
        if addr.is_ipv4() {
            32
        } else {
            128
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNet {
    type Err = PolicyError;

    /// Parse "203.0.113.0/24", "203.0.113.7" (host), or IPv6 equivalents.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PolicyError::InvalidCidr(s.to_string());
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.trim().parse().map_err(|_| bad())?;
                let prefix: u8 = prefix.trim().parse().map_err(|_| bad())?;
                IpNet::new(addr, prefix)
            }
            None => {
                let addr: IpAddr = s.trim().parse().map_err(|_| bad())?;
                Ok(IpNet::host(addr))
            }
        }
    }
}

impl TryFrom<String> for IpNet {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpNet> for String {
    fn from(net: IpNet) -> Self {
        net.to_string()
    }
}

impl From<IpAddr> for IpNet {
    fn from(addr: IpAddr) -> Self {
        IpNet::host(addr)
    }
}

impl From<Ipv4Addr> for IpNet {
    fn from(addr: Ipv4Addr) -> Self {
        IpNet::host(IpAddr::V4(addr))
    }
}

impl From<Ipv6Addr> for IpNet {
    fn from(addr: Ipv6Addr) -> Self {
        IpNet::host(IpAddr::V6(addr))
    }
}

// IPv4 addresses live in the low 32 bits of the u128.
fn to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_bits(bits: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(bits as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(bits))
    }
}

fn mask_bits(bits: u128, prefix: u8, family_bits: u8) -> u128 {
    bits & !low_bits(family_bits - prefix)
}

// A value with `n` low bits set. `n` may be the full family width.
fn low_bits(n: u8) -> u128 {
    if n >= 128 {
        u128::MAX
    } else {
        (1u128 << n) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let net: IpNet = "203.0.113.0/24".parse().unwrap();
        assert_eq!(net.to_string(), "203.0.113.0/24");
        assert_eq!(net.prefix(), 24);
    }

    #[test]
    fn bare_address_becomes_host_net() {
        let net: IpNet = "203.0.113.7".parse().unwrap();
        assert_eq!(net.to_string(), "203.0.113.7/32");

        let v6: IpNet = "2001:db8::1".parse().unwrap();
        assert_eq!(v6.prefix(), 128);
    }

    #[test]
    fn host_bits_are_masked() {
        let net: IpNet = "203.0.113.77/24".parse().unwrap();
        assert_eq!(net.to_string(), "203.0.113.0/24");

        let same: IpNet = "203.0.113.0/24".parse().unwrap();
        assert_eq!(net, same);
    }

    #[test]
    fn contains_network_bounds() {
        // Both the lower and upper bound addresses are inside.
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(net.contains("10.0.0.0".parse().unwrap()));
        assert!(net.contains("10.0.0.255".parse().unwrap()));
        assert!(!net.contains("10.0.1.0".parse().unwrap()));
        assert!(!net.contains("9.255.255.255".parse().unwrap()));
    }

    #[test]
    fn contains_rejects_other_family() {
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        assert!(!net.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn containment_and_overlap() {
        let wide: IpNet = "10.0.0.0/8".parse().unwrap();
        let narrow: IpNet = "10.1.2.0/24".parse().unwrap();
        let other: IpNet = "192.168.0.0/16".parse().unwrap();

        assert!(wide.contains_net(&narrow));
        assert!(!narrow.contains_net(&wide));
        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
        assert!(!wide.overlaps(&other));
    }

    #[test]
    fn zero_prefix_contains_everything_v4() {
        let any: IpNet = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("255.255.255.255".parse().unwrap()));
        assert!(any.contains("0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn v6_zero_prefix() {
        let any: IpNet = "::/0".parse().unwrap();
        assert!(any.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn last_address() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(net.last(), "10.0.0.255".parse::<IpAddr>().unwrap());
        let host: IpNet = "10.0.0.7/32".parse().unwrap();
        assert_eq!(host.last(), "10.0.0.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn broader_than_prefix_limit() {
        let net: IpNet = "10.0.0.0/16".parse().unwrap();
        assert!(net.broader_than(24));
        let exact: IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(!exact.broader_than(24));
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
        assert!("not-an-address".parse::<IpNet>().is_err());
        assert!("10.0.0.0/abc".parse::<IpNet>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let net: IpNet = "203.0.113.0/24".parse().unwrap();
        let json = serde_json::to_string(&net).unwrap();
        assert_eq!(json, "\"203.0.113.0/24\"");
        let back: IpNet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, net);
    }
}
