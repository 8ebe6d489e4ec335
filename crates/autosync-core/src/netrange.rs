//! Address classification
//!
//! Decides whether the host can be reached directly and whether a callback
//! source belongs to the bank.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

/// Published source range of bunq's callback servers
pub const BUNQ_NETWORK: &str = "185.40.108.0/22";

/// Networks the bank sends callbacks from
pub fn provider_networks() -> Vec<IpNetwork> {
    BUNQ_NETWORK.parse::<IpNetwork>().into_iter().collect()
}

/// Whether `ip` is a callback source we accept
///
/// Loopback is always trusted so a local reverse proxy or a manual
/// `curl` from the host can trigger a sync.
pub fn is_trusted_source(ip: IpAddr, networks: &[IpNetwork]) -> bool {
    ip.is_loopback() || networks.iter().any(|net| net.contains(ip))
}

/// Whether `ip` is not reachable from the internet
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        // 100.64.0.0/10 (Carrier-Grade NAT)
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64)
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
