//! CIDR parsing, normalization and range-to-CIDR expansion.
//!
//! This is the leaf component: every other crate in the workspace that deals
//! in routes builds on [`CidrRoute`].

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("CIDR string is empty")]
    Empty,
    #[error("expected exactly one '/' in {0:?}")]
    MissingSlash(String),
    #[error("could not parse address {0:?}")]
    BadAddress(String),
    #[error("could not parse prefix length {0:?}")]
    BadPrefix(String),
    #[error("prefix length {prefix} out of range for {family:?} (max {max})")]
    PrefixOutOfRange {
        family: Family,
        prefix: u8,
        max: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn max_prefix(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// An immutable, normalized CIDR block.
///
/// `network` always has its host bits zeroed. `mask` is the dotted-quad form
/// for v4 and empty for v6 (v6 has no conventional dotted mask notation).
#[derive(Debug, Clone, Eq)]
pub struct CidrRoute {
    family: Family,
    network: IpAddr,
    prefix_len: u8,
}

impl PartialEq for CidrRoute {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.network == other.network && self.prefix_len == other.prefix_len
    }
}

impl std::hash::Hash for CidrRoute {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.network.hash(state);
        self.prefix_len.hash(state);
    }
}

impl CidrRoute {
    /// Builds a route directly from an already-aligned network address and prefix length.
    ///
    /// Host bits in `network` are masked off regardless of whether the caller
    /// already zeroed them.
    pub fn new(network: IpAddr, prefix_len: u8) -> Result<Self, CidrError> {
        let family = match network {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };
        let max = family.max_prefix();
        if prefix_len > max {
            return Err(CidrError::PrefixOutOfRange {
                family,
                prefix: prefix_len,
                max,
            });
        }
        let network = match network {
            IpAddr::V4(v4) => IpAddr::V4(mask_v4(v4, prefix_len)),
            IpAddr::V6(v6) => IpAddr::V6(mask_v6(v6, prefix_len)),
        };
        Ok(Self {
            family,
            network,
            prefix_len,
        })
    }

    /// Parses `"address/prefix"`, trimming surrounding whitespace.
    pub fn parse(s: &str) -> Result<Self, CidrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CidrError::Empty);
        }

        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 2 {
            return Err(CidrError::MissingSlash(s.to_string()));
        }
        let (addr_part, prefix_part) = (parts[0], parts[1]);

        let addr: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| CidrError::BadAddress(addr_part.to_string()))?;
        let prefix: u8 = prefix_part
            .trim()
            .parse()
            .map_err(|_| CidrError::BadPrefix(prefix_part.to_string()))?;

        Self::new(addr, prefix)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Dotted-quad mask for v4; `None` for v6.
    pub fn mask_v4(&self) -> Option<Ipv4Addr> {
        match self.network {
            IpAddr::V4(_) => Some(prefix_to_mask_v4(self.prefix_len)),
            IpAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for CidrRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl PartialOrd for CidrRoute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CidrRoute {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family
            .cmp(&other.family)
            .then_with(|| self.network.to_string().cmp(&other.network.to_string()))
            .then_with(|| self.prefix_len.cmp(&other.prefix_len))
    }
}

fn prefix_to_mask_v4(prefix_len: u8) -> Ipv4Addr {
    let bits: u32 = if prefix_len == 0 {
        0
    } else {
        0xFFFF_FFFFu32 << (32 - prefix_len as u32)
    };
    Ipv4Addr::from(bits)
}

fn mask_v4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = prefix_to_mask_v4(prefix_len);
    Ipv4Addr::from(u32::from(addr) & u32::from(mask))
}

fn mask_v6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let mut bytes = addr.octets();
    let full_bytes = (prefix_len / 8) as usize;
    let remaining_bits = prefix_len % 8;

    for byte in bytes.iter_mut().skip(full_bytes + if remaining_bits > 0 { 1 } else { 0 }) {
        *byte = 0;
    }
    if remaining_bits > 0 && full_bytes < bytes.len() {
        let keep_mask = 0xFFu8 << (8 - remaining_bits);
        bytes[full_bytes] &= keep_mask;
    }
    Ipv6Addr::from(bytes)
}

/// Expands an IPv4 `(start, count)` host range into a minimal set of
/// aligned CIDR blocks, using the standard greedy align-then-size algorithm.
pub fn expand_range_v4(start: Ipv4Addr, count: u64) -> Result<Vec<CidrRoute>, CidrError> {
    let mut out = Vec::new();
    let mut cur = u64::from(u32::from(start));
    let mut remaining = count;

    while remaining > 0 {
        let align = if cur == 0 {
            1u64 << 32
        } else {
            1u64 << cur.trailing_zeros()
        };
        let cap = largest_pow2_le(remaining);
        let mut block = align.min(cap);

        while cur + block > 1u64 << 32 {
            block /= 2;
        }

        let prefix = 32 - block.trailing_zeros() as u8;
        let network = Ipv4Addr::from(cur as u32);
        out.push(CidrRoute::new(IpAddr::V4(network), prefix)?);

        cur += block;
        remaining -= block;
    }

    Ok(out)
}

fn largest_pow2_le(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    1u64 << (63 - n.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_masks_host_bits() {
        let r = CidrRoute::parse("10.0.0.5/24").unwrap();
        assert_eq!(r.network(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(r.prefix_len(), 24);
        assert_eq!(r.mask_v4(), Some("255.255.255.0".parse().unwrap()));
    }

    #[test]
    fn parses_v6_and_masks_host_bits() {
        let r = CidrRoute::parse("fe80::1234/10").unwrap();
        assert_eq!(r.network(), "fe80::".parse::<IpAddr>().unwrap());
        assert_eq!(r.prefix_len(), 10);
    }

    #[test]
    fn round_trips_through_display() {
        let r = CidrRoute::parse("1.2.3.0/24").unwrap();
        let s = r.to_string();
        let r2 = CidrRoute::parse(&s).unwrap();
        assert_eq!(r, r2);
    }

    #[test]
    fn rejects_missing_slash() {
        assert_eq!(CidrRoute::parse("10.0.0.0"), Err(CidrError::MissingSlash("10.0.0.0".to_string())));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(CidrRoute::parse("  "), Err(CidrError::Empty));
    }

    #[test]
    fn rejects_prefix_out_of_range() {
        let err = CidrRoute::parse("10.0.0.0/33").unwrap_err();
        assert!(matches!(err, CidrError::PrefixOutOfRange { .. }));
    }

    #[test]
    fn expands_aligned_slash24() {
        let out = expand_range_v4("1.0.0.0".parse().unwrap(), 256).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_string(), "1.0.0.0/24");
    }

    #[test]
    fn expands_unaligned_start() {
        let out = expand_range_v4("1.0.0.1".parse().unwrap(), 256).unwrap();
        let strs: Vec<String> = out.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            strs,
            vec![
                "1.0.0.1/32",
                "1.0.0.2/31",
                "1.0.0.4/30",
                "1.0.0.8/29",
                "1.0.0.16/28",
                "1.0.0.32/27",
                "1.0.0.64/26",
                "1.0.0.128/25",
                "1.0.1.0/32",
            ]
        );
    }

    #[test]
    fn expansion_covers_exact_host_count() {
        let out = expand_range_v4("10.1.2.3".parse().unwrap(), 777).unwrap();
        let total: u64 = out.iter().map(|c| 1u64 << (32 - c.prefix_len() as u32)).sum();
        assert_eq!(total, 777);
    }

    #[test]
    fn single_address_range() {
        let out = expand_range_v4("192.168.1.1".parse().unwrap(), 1).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_string(), "192.168.1.1/32");
    }

    #[test]
    fn canonical_ordering_v4_before_v6() {
        let mut routes = vec![
            CidrRoute::parse("::1/128").unwrap(),
            CidrRoute::parse("10.0.0.0/8").unwrap(),
        ];
        routes.sort();
        assert_eq!(routes[0].family(), Family::V4);
        assert_eq!(routes[1].family(), Family::V6);
    }
}
