//! Client identity resolution.
//!
//! Derives the per-client key used for rate limit counters from proxy
//! headers, validating addresses and folding IPv6 addresses to the block a
//! single subscriber is likely to rotate within.

mod range;
mod resolver;

pub use range::{
    default_mobile_prefixes, default_trusted_proxies, parse_ranges, IpRange,
    DEFAULT_MOBILE_PREFIXES, DEFAULT_TRUSTED_PROXIES,
};
pub use resolver::{
    validate_ip, ClientIdentityResolver, HeaderLookup, IdentityConfig, FORWARDED_FOR_HEADER,
    MAX_IP_LEN, REAL_IP_HEADER, UNKNOWN_CLIENT,
};
