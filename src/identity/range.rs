//! CIDR ranges for trusted proxies and mobile carrier prefixes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::WardenError;

/// Cloudflare and Vercel edge ranges.
///
/// Refresh periodically from <https://www.cloudflare.com/ips/> and the
/// Vercel edge network documentation.
pub const DEFAULT_TRUSTED_PROXIES: &[&str] = &[
    // Cloudflare IPv4
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
    // Cloudflare IPv6
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
    // Vercel IPv4
    "76.76.21.0/24",
];

/// IPv6 blocks allocated to mobile carriers, which hand each device a
/// whole /64.
///
/// This list is a heuristic starting point, not an authoritative registry.
pub const DEFAULT_MOBILE_PREFIXES: &[&str] = &[
    // T-Mobile US
    "2607:fb90::/32",
    // Verizon Wireless
    "2600:1000::/28",
    // AT&T Mobility
    "2600:380::/28",
];

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpRange {
    network: IpAddr,
    prefix_len: u8,
}

impl IpRange {
    /// Create a range, rejecting prefix lengths longer than the address.
    pub fn new(network: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix_len <= max).then_some(Self {
            network,
            prefix_len,
        })
    }

    /// Whether `ip` falls inside this range. Families never match each other.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0)
}

fn prefix_mask_u128(len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0)
}

impl FromStr for IpRange {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WardenError::Config(format!("Invalid CIDR range: {}", s));

        let (addr, len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = len.parse().map_err(|_| invalid())?;
        IpRange::new(network, prefix_len).ok_or_else(invalid)
    }
}

impl TryFrom<String> for IpRange {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpRange> for String {
    fn from(range: IpRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Parse a list of CIDR strings.
pub fn parse_ranges(ranges: &[&str]) -> Result<Vec<IpRange>, WardenError> {
    ranges.iter().map(|r| r.parse()).collect()
}

/// Known edge-proxy ranges.
pub fn default_trusted_proxies() -> Vec<IpRange> {
    // Built-in entries are valid CIDR; see `test_builtin_tables_parse`.
    DEFAULT_TRUSTED_PROXIES
        .iter()
        .filter_map(|r| r.parse().ok())
        .collect()
}

/// Known mobile carrier IPv6 prefixes.
pub fn default_mobile_prefixes() -> Vec<IpRange> {
    DEFAULT_MOBILE_PREFIXES
        .iter()
        .filter_map(|r| r.parse().ok())
        .collect()
}
