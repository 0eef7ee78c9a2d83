//! Address blocklist for raw screenshots.
//!
//! Raw mode will point the browser at any host a user names, so the target is
//! resolved up front and refused when any of its addresses falls into a
//! private, loopback, link-local, documentation or otherwise reserved range.

use std::net::IpAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use ipnet::IpNet;
use tracing::warn;

const BLOCKED_SUBNETS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "233.252.0.0/24",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "::ffff:0:0:0/96",
    "64:ff9b::/96",
    "64:ff9b:1::/48",
    "100::/64",
    "2001::/32",
    "2001:20::/28",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// Default blocklist of special-purpose address ranges.
pub static BLOCKED_IPS: LazyLock<IpBlockList> = LazyLock::new(IpBlockList::with_defaults);

/// Set of subnets an outbound render may not reach.
#[derive(Debug, Clone, Default)]
pub struct IpBlockList {
    subnets: Vec<IpNet>,
}

impl IpBlockList {
    /// Create an empty blocklist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocklist covering the IANA special-purpose ranges.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut list = Self::new();
        for cidr in BLOCKED_SUBNETS {
            if let Err(e) = list.add_subnet(cidr) {
                warn!("Skipping blocked subnet: {e:#}");
            }
        }
        list
    }

    /// Add a subnet in CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if `cidr` is not valid CIDR notation.
    fn add_subnet(&mut self, cidr: &str) -> Result<&mut Self> {
        let net = cidr
            .parse::<IpNet>()
            .with_context(|| format!("Invalid subnet: {cidr}"))?;
        self.subnets.push(net.trunc());
        Ok(self)
    }

    /// Whether `ip` falls into any blocked subnet.
    ///
    /// IPv4-mapped IPv6 addresses are also checked against the IPv4 ranges.
    #[must_use]
    pub fn check(&self, ip: IpAddr) -> bool {
        let mapped = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };
        self.subnets
            .iter()
            .any(|net| net.contains(&ip) || mapped.is_some_and(|v4| net.contains(&v4)))
    }
}

/// Resolve `host` and return every address it maps to.
///
/// # Errors
///
/// Returns an error if the name cannot be resolved.
pub async fn resolve_host(host: &str) -> Result<Vec<IpAddr>> {
    // IPv6 literals come out of `Url::host_str` bracketed.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs = tokio::net::lookup_host((bare, 0))
        .await
        .with_context(|| format!("Failed to resolve {host}"))?;
    let ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
    if ips.is_empty() {
        anyhow::bail!("{host} resolved to no addresses");
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_default_subnets_parse() {
        assert_eq!(IpBlockList::with_defaults().subnets.len(), BLOCKED_SUBNETS.len());
    }

    #[test]
    fn test_blocks_private_ranges() {
        let list = IpBlockList::with_defaults();
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.5.4",
            "192.168.1.1",
            "169.254.169.254",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fe80::1",
            "fd12:3456::1",
            "::ffff:127.0.0.1",
        ] {
            assert!(list.check(ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_allows_public_addresses() {
        let list = IpBlockList::with_defaults();
        for ip in ["1.1.1.1", "93.184.216.34", "2606:4700:4700::1111"] {
            assert!(!list.check(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn test_add_subnet() {
        let mut list = IpBlockList::new();
        list.add_subnet("8.8.8.0/24").unwrap();
        assert!(list.check("8.8.8.8".parse().unwrap()));
        assert!(!list.check("8.8.4.4".parse().unwrap()));
        assert!(list.add_subnet("not-a-subnet").is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let ips = resolve_host("127.0.0.1").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let ips = resolve_host("[::1]").await.unwrap();
        assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
    }
}
