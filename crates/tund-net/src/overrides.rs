//! Per-profile record of host networking changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A route installed by a tunnel process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Route {
    /// Destination network address
    pub addr: IpAddr,
    /// Prefix length
    pub prefix: u8,
    /// Next hop, if the route is not on-link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<IpAddr>,
}

impl Route {
    /// Parse `addr/prefix` (a bare address is a host route).
    pub fn parse_cidr(cidr: &str, via: Option<IpAddr>) -> Option<Self> {
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, prefix.parse::<u8>().ok()?),
            None => {
                let addr = cidr.parse::<IpAddr>().ok()?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return None;
        }
        Some(Self { addr, prefix, via })
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Everything one profile changed on the host.
///
/// Assembled from the tunnel process's status output and consumed
/// by [`NetworkCleaner::rollback_override`](crate::NetworkCleaner::rollback_override).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOverride {
    /// Virtual interface created for the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// DNS servers pushed to the host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<IpAddr>,
    /// Search domains pushed to the host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
    /// Routes added to the routing table
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl NetworkOverride {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.interface.is_none()
            && self.dns_servers.is_empty()
            && self.search_domains.is_empty()
            && self.routes.is_empty()
    }

    pub fn touches_dns(&self) -> bool {
        !self.dns_servers.is_empty() || !self.search_domains.is_empty()
    }

    pub fn set_interface(&mut self, name: impl Into<String>) {
        self.interface = Some(name.into());
    }

    pub fn add_dns_server(&mut self, server: IpAddr) {
        if !self.dns_servers.contains(&server) {
            self.dns_servers.push(server);
        }
    }

    pub fn add_search_domain(&mut self, domain: impl Into<String>) {
        let domain = domain.into();
        if !self.search_domains.contains(&domain) {
            self.search_domains.push(domain);
        }
    }

    pub fn add_route(&mut self, route: Route) {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
    }

    /// Fold another partial record into this one.
    pub fn merge(&mut self, other: NetworkOverride) {
        if let Some(iface) = other.interface {
            self.interface = Some(iface);
        }
        for server in other.dns_servers {
            self.add_dns_server(server);
        }
        for domain in other.search_domains {
            self.add_search_domain(domain);
        }
        for route in other.routes {
            self.add_route(route);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let route = Route::parse_cidr("10.8.0.0/24", None).unwrap();
        assert_eq!(route.prefix, 24);
        assert_eq!(route.to_string(), "10.8.0.0/24");

        let host = Route::parse_cidr("192.0.2.1", None).unwrap();
        assert_eq!(host.prefix, 32);

        let v6 = Route::parse_cidr("fd00::/64", None).unwrap();
        assert!(v6.is_ipv6());

        assert!(Route::parse_cidr("10.0.0.0/33", None).is_none());
        assert!(Route::parse_cidr("not-an-ip/8", None).is_none());
    }

    #[test]
    fn test_override_dedup() {
        let mut record = NetworkOverride::new();
        assert!(record.is_empty());

        let dns: IpAddr = "10.8.0.1".parse().unwrap();
        record.add_dns_server(dns);
        record.add_dns_server(dns);
        assert_eq!(record.dns_servers.len(), 1);
        assert!(record.touches_dns());

        let route = Route::parse_cidr("10.8.0.0/24", None).unwrap();
        record.add_route(route.clone());
        record.add_route(route);
        assert_eq!(record.routes.len(), 1);
    }

    #[test]
    fn test_merge() {
        let mut base = NetworkOverride::new();
        base.set_interface("tun0");
        base.add_search_domain("corp.example");

        let mut more = NetworkOverride::new();
        more.add_search_domain("corp.example");
        more.add_route(Route::parse_cidr("0.0.0.0/1", None).unwrap());

        base.merge(more);
        assert_eq!(base.interface.as_deref(), Some("tun0"));
        assert_eq!(base.search_domains.len(), 1);
        assert_eq!(base.routes.len(), 1);
    }
}
