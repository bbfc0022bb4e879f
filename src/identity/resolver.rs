//! Client identity resolution from proxy headers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, trace};

use super::range::{default_mobile_prefixes, default_trusted_proxies, IpRange};

/// Single-hop header set by the edge proxy.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Multi-hop forwarding chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Shared bucket for clients without a usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";
/// Longest textual IP address (IPv4-mapped IPv6).
pub const MAX_IP_LEN: usize = 45;

/// Read-only access to request headers by case-insensitive name.
pub trait HeaderLookup {
    /// Get the value of a header, if present.
    fn header(&self, name: &str) -> Option<&str>;
}

impl<S: BuildHasher> HeaderLookup for HashMap<String, String, S> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }
}

impl HeaderLookup for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl<'a> HeaderLookup for [(&'a str, &'a str)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

impl<'a, const N: usize> HeaderLookup for [(&'a str, &'a str); N] {
    fn header(&self, name: &str) -> Option<&str> {
        self.as_slice().header(name)
    }
}

/// Client identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Reverse proxy layers between the client and this service
    #[serde(default = "default_trusted_proxy_count")]
    pub trusted_proxy_count: usize,

    /// IPv6 prefixes folded to /64 instead of /48
    #[serde(default = "default_mobile_prefixes")]
    pub mobile_prefixes: Vec<IpRange>,

    /// Proxy ranges that are never treated as the client
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<IpRange>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trusted_proxy_count: default_trusted_proxy_count(),
            mobile_prefixes: default_mobile_prefixes(),
            trusted_proxies: default_trusted_proxies(),
        }
    }
}

fn default_trusted_proxy_count() -> usize {
    2
}

/// Validate an IP literal.
///
/// The length bound is checked before any parsing. IPv4 must be four decimal
/// octets; IPv6 must be at most eight hextets of up to four hex digits, with
/// `::` compression allowed. Zone IDs and ports are rejected, and so are IPv4
/// octets with leading zeros (`010.0.0.1`), which some parsers read as octal.
pub fn validate_ip(candidate: &str) -> Option<IpAddr> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.len() > MAX_IP_LEN {
        return None;
    }

    if candidate.contains(':') {
        candidate.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
    } else {
        candidate.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
    }
}

/// Derives the rate limit identifier for a request.
#[derive(Debug, Clone)]
pub struct ClientIdentityResolver {
    trusted_proxy_count: usize,
    mobile_prefixes: Vec<IpRange>,
    trusted_proxies: Vec<IpRange>,
}

impl ClientIdentityResolver {
    /// Create a resolver from settings.
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            trusted_proxy_count: config.trusted_proxy_count,
            mobile_prefixes: config.mobile_prefixes.clone(),
            trusted_proxies: config.trusted_proxies.clone(),
        }
    }

    /// Override the number of trusted proxy hops.
    pub fn with_trusted_proxy_count(mut self, count: usize) -> Self {
        self.trusted_proxy_count = count;
        self
    }

    /// Resolve the identifier: the real-IP header if valid, else the
    /// forwarded-for entry left of the trusted hops, else [`UNKNOWN_CLIENT`].
    ///
    /// Unidentifiable clients share one bucket rather than skipping limits.
    pub fn resolve<H: HeaderLookup + ?Sized>(&self, headers: &H) -> String {
        if let Some(ip) = headers.header(REAL_IP_HEADER).and_then(validate_ip) {
            trace!(ip = %ip, "Client identified by real IP header");
            return self.normalize(ip);
        }

        if let Some(ip) = headers
            .header(FORWARDED_FOR_HEADER)
            .and_then(|chain| self.client_from_chain(chain))
        {
            trace!(ip = %ip, "Client identified by forwarding chain");
            return self.normalize(ip);
        }

        debug!("No valid client IP in proxy headers, using shared bucket");
        UNKNOWN_CLIENT.to_string()
    }

    /// Pick the client out of a forwarding chain.
    ///
    /// The last `trusted_proxy_count` entries were appended by our own
    /// proxies, so the client sits just left of them. If that entry is itself
    /// a known proxy the hop count is short, and we keep stepping left. A
    /// chain made only of known proxies has no client.
    fn client_from_chain(&self, chain: &str) -> Option<IpAddr> {
        let hops: Vec<&str> = chain.split(',').map(str::trim).collect();
        let mut index = hops
            .len()
            .saturating_sub(self.trusted_proxy_count.saturating_add(1));

        loop {
            let ip = validate_ip(hops.get(index)?)?;
            if !self.is_trusted_proxy(&ip) {
                return Some(ip);
            }
            trace!(ip = %ip, index, "Skipping trusted proxy in forwarding chain");
            index = index.checked_sub(1)?;
        }
    }

    /// Whether `ip` belongs to a known edge proxy.
    pub fn is_trusted_proxy(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.iter().any(|range| range.contains(ip))
    }

    /// Fold an address into its rate limit key.
    ///
    /// IPv4 is kept as is. IPv6 is folded to its allocation block: /64 for
    /// known mobile carriers, /48 otherwise. This is a heuristic for
    /// address rotation within a block, not a guarantee of one key per
    /// subscriber.
    pub fn normalize(&self, ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return v4.to_string();
                }

                let s = v6.segments();
                if self.mobile_prefixes.iter().any(|range| range.contains(&ip)) {
                    format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3])
                } else {
                    format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2])
                }
            }
        }
    }
}

impl Default for ClientIdentityResolver {
    fn default() -> Self {
        Self::new(&IdentityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ClientIdentityResolver {
        ClientIdentityResolver::default()
    }

    #[test]
    fn test_validate_ipv4() {
        assert!(validate_ip("203.0.113.5").is_some());
        assert!(validate_ip(" 10.0.0.1 ").is_some());
        assert!(validate_ip("256.0.0.1").is_none());
        assert!(validate_ip("1.2.3").is_none());
        assert!(validate_ip("1.2.3.4.5").is_none());
        assert!(validate_ip("a.b.c.d").is_none());
        assert!(validate_ip("").is_none());
        assert!(validate_ip("0.0.0.0").is_some());
        assert!(validate_ip("255.255.255.255").is_some());
    }

    #[test]
    fn test_validate_rejects_leading_zero_octets() {
        assert!(validate_ip("010.0.0.1").is_none());
        assert!(validate_ip("192.168.01.1").is_none());
        assert!(validate_ip("10.0.0.1").is_some());
    }

    #[test]
    fn test_validate_ipv6() {
        assert!(validate_ip("2001:db8::1").is_some());
        assert!(validate_ip("::1").is_some());
        assert!(validate_ip("2001:0db8:0000:0000:0000:0000:0000:0001").is_some());
        assert!(validate_ip("2001:db8:0:0:0:0:0:0:1").is_none());
        assert!(validate_ip("2001:db8::12345").is_none());
        assert!(validate_ip("2001:db8::g").is_none());
        assert!(validate_ip("1.2.3.4:8080").is_none());
    }

    #[test]
    fn test_validate_rejects_oversized_input() {
        let long = "1".repeat(10_000);
        assert!(validate_ip(&long).is_none());
        let padded = format!("{}::1", "0:".repeat(30));
        assert!(validate_ip(&padded).is_none());
    }

    #[test]
    fn test_real_ip_wins() {
        let headers = [
            ("X-Real-IP", "203.0.113.5"),
            ("X-Forwarded-For", "198.51.100.1, 10.0.0.1, 10.0.0.2"),
        ];
        assert_eq!(resolver().resolve(&headers), "203.0.113.5");
    }

    #[test]
    fn test_forwarded_chain_with_two_trusted_hops() {
        let headers = [("x-forwarded-for", "198.51.100.1, 10.0.0.1, 10.0.0.2")];
        assert_eq!(resolver().resolve(&headers), "198.51.100.1");
    }

    #[test]
    fn test_forwarded_chain_ignores_spoofed_prefix() {
        // Client prepended a fake entry; the real client is still 3rd from the right
        let headers = [(
            "x-forwarded-for",
            "6.6.6.6, 198.51.100.1, 10.0.0.1, 10.0.0.2",
        )];
        assert_eq!(resolver().resolve(&headers), "198.51.100.1");
    }

    #[test]
    fn test_short_chain_clamps_to_first_entry() {
        let headers = [("x-forwarded-for", "198.51.100.9")];
        assert_eq!(resolver().resolve(&headers), "198.51.100.9");
    }

    #[test]
    fn test_invalid_real_ip_falls_back_to_chain() {
        let headers = [
            ("x-real-ip", "not-an-ip"),
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1, 10.0.0.2"),
        ];
        assert_eq!(resolver().resolve(&headers), "198.51.100.1");
    }

    #[test]
    fn test_invalid_chain_entry_is_unknown() {
        let headers = [("x-forwarded-for", "garbage, 10.0.0.1, 10.0.0.2")];
        assert_eq!(resolver().resolve(&headers), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_no_headers_is_unknown() {
        let headers: [(&str, &str); 0] = [];
        assert_eq!(resolver().resolve(&headers), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_trusted_proxy_count_override() {
        let resolver = resolver().with_trusted_proxy_count(0);
        let headers = [("x-forwarded-for", "198.51.100.1, 10.0.0.1, 10.0.0.2")];
        assert_eq!(resolver.resolve(&headers), "10.0.0.2");
    }

    #[test]
    fn test_steps_left_past_known_proxy() {
        // Hop count of 1 lands on a Cloudflare address
        let resolver = resolver().with_trusted_proxy_count(1);
        let headers = [("x-forwarded-for", "198.51.100.1, 104.16.0.1, 10.0.0.2")];
        assert_eq!(resolver.resolve(&headers), "198.51.100.1");
        assert!(resolver.is_trusted_proxy(&"104.16.0.1".parse().unwrap()));
    }

    #[test]
    fn test_chain_of_known_proxies_is_unknown() {
        let headers = [("x-forwarded-for", "104.16.0.1, 10.0.0.1, 10.0.0.2")];
        assert_eq!(resolver().resolve(&headers), UNKNOWN_CLIENT);

        let headers = [("x-forwarded-for", "173.245.48.1, 104.16.0.1, 10.0.0.2")];
        let resolver = resolver().with_trusted_proxy_count(1);
        assert_eq!(resolver.resolve(&headers), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_hashmap_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("X-Real-Ip".to_string(), "203.0.113.5".to_string());
        assert_eq!(resolver().resolve(&headers), "203.0.113.5");
    }

    #[test]
    fn test_ipv4_is_never_folded() {
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        assert_eq!(resolver().normalize(ip), "203.0.113.5");
    }

    #[test]
    fn test_ipv4_mapped_ipv6_keyed_as_ipv4() {
        let headers = [("x-real-ip", "::ffff:203.0.113.5")];
        assert_eq!(resolver().resolve(&headers), "203.0.113.5");
    }

    #[test]
    fn test_ipv6_folds_to_48() {
        let r = resolver();
        let a = r.normalize("2001:db8:abcd:1::1".parse().unwrap());
        let b = r.normalize("2001:db8:abcd:2::99".parse().unwrap());
        assert_eq!(a, "2001:db8:abcd::/48");
        assert_eq!(a, b);

        let other = r.normalize("2001:db8:abce:1::1".parse().unwrap());
        assert_ne!(a, other);
    }

    #[test]
    fn test_mobile_ipv6_folds_to_64() {
        let r = resolver();
        let a = r.normalize("2607:fb90:1:2:aaaa::1".parse().unwrap());
        let b = r.normalize("2607:fb90:1:2:bbbb::2".parse().unwrap());
        assert_eq!(a, "2607:fb90:1:2::/64");
        assert_eq!(a, b);

        // Same /48, different /64: distinct mobile subscribers
        let c = r.normalize("2607:fb90:1:3::1".parse().unwrap());
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_config_from_yaml() {
        let yaml = r#"
trusted_proxy_count: 1
mobile_prefixes: ["2001:db8::/32"]
"#;
        let config: IdentityConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.trusted_proxy_count, 1);
        assert_eq!(config.mobile_prefixes.len(), 1);
        assert_eq!(config.trusted_proxies, default_trusted_proxies());
    }
}
