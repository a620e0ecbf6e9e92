//! Status markers in tunnel program output.
//!
//! The tunnel program is opaque; its log lines are the only window
//! into its progress. A line may carry several comma-separated
//! options (e.g. a pushed option list), so each segment is matched
//! on its own.

use std::collections::VecDeque;
use std::net::IpAddr;
use tund_net::{NetworkOverride, Route};

const CONNECTED_WITH_ERRORS: &str = "initialization sequence completed with errors";
const CONNECTED: &[&str] = &["initialization sequence completed", "tunnel established"];
const AUTH_FAILED: &[&str] = &["auth_failed", "authentication failed"];
const NETWORK_FAILED: &[&str] = &[
    "connection refused",
    "network is unreachable",
    "cannot resolve host",
    "tls handshake failed",
    "connection timed out",
    "inactivity timeout",
];

/// A recognized event in one output segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMarker {
    Connected,
    /// Up, but some routes or DNS settings failed to apply
    ConnectedWithErrors,
    AuthFailed,
    NetworkError,
    Interface(String),
    Dns(IpAddr),
    SearchDomain(String),
    Route(Route),
}

impl StatusMarker {
    /// Parse every marker in a line.
    pub fn parse_line(line: &str) -> Vec<StatusMarker> {
        line.split(',').filter_map(Self::parse_segment).collect()
    }

    fn parse_segment(segment: &str) -> Option<StatusMarker> {
        let lower = segment.to_ascii_lowercase();
        let contains_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

        if contains_any(AUTH_FAILED) {
            return Some(StatusMarker::AuthFailed);
        }
        if lower.contains(CONNECTED_WITH_ERRORS) {
            return Some(StatusMarker::ConnectedWithErrors);
        }
        if contains_any(CONNECTED) {
            return Some(StatusMarker::Connected);
        }
        if let Some(name) = token_after(segment, &lower, "tun/tap device ") {
            return Some(StatusMarker::Interface(name.to_string()));
        }
        if let Some(addr) = token_after(segment, &lower, "dhcp-option dns ") {
            return addr.parse().ok().map(StatusMarker::Dns);
        }
        if let Some(domain) = token_after(segment, &lower, "dhcp-option domain ") {
            return Some(StatusMarker::SearchDomain(domain.to_string()));
        }
        for key in ["net_route_v4_add: ", "net_route_v6_add: "] {
            if let Some(start) = lower.find(key) {
                return parse_route(&segment[start + key.len()..]).map(StatusMarker::Route);
            }
        }
        if contains_any(NETWORK_FAILED) {
            return Some(StatusMarker::NetworkError);
        }
        None
    }
}

/// First whitespace-delimited token after `key` (matched case-insensitively).
fn token_after<'a>(segment: &'a str, lower: &str, key: &str) -> Option<&'a str> {
    let start = lower.find(key)? + key.len();
    segment[start..]
        .split(|c: char| c.is_whitespace() || c == '\'' || c == '"')
        .find(|t| !t.is_empty())
}

/// `<cidr> via <gateway> ...`; an unspecified gateway means on-link.
fn parse_route(rest: &str) -> Option<Route> {
    let mut tokens = rest.split_whitespace();
    let cidr = tokens.next()?;
    let via = match (tokens.next(), tokens.next()) {
        (Some("via"), Some(gw)) => gw.parse::<IpAddr>().ok().filter(|ip| !ip.is_unspecified()),
        _ => None,
    };
    Route::parse_cidr(cidr, via)
}

/// Accumulates markers and the tail of the output for one process.
#[derive(Debug)]
pub struct StatusTracker {
    lines: VecDeque<String>,
    capacity: usize,
    observed: NetworkOverride,
    connected: bool,
    auth_failed: bool,
    network_error: bool,
}

impl StatusTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            observed: NetworkOverride::new(),
            connected: false,
            auth_failed: false,
            network_error: false,
        }
    }

    /// Record a line and return the markers it carried.
    pub fn observe(&mut self, line: &str) -> Vec<StatusMarker> {
        if self.capacity > 0 {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }

        let markers = StatusMarker::parse_line(line);
        for marker in &markers {
            match marker {
                StatusMarker::Connected | StatusMarker::ConnectedWithErrors => self.connected = true,
                StatusMarker::AuthFailed => self.auth_failed = true,
                StatusMarker::NetworkError => self.network_error = true,
                StatusMarker::Interface(name) => self.observed.set_interface(name.clone()),
                StatusMarker::Dns(addr) => self.observed.add_dns_server(*addr),
                StatusMarker::SearchDomain(domain) => self.observed.add_search_domain(domain.clone()),
                StatusMarker::Route(route) => self.observed.add_route(route.clone()),
            }
        }
        markers
    }

    pub fn last_lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Host changes seen so far, possibly partial.
    pub fn observed(&self) -> &NetworkOverride {
        &self.observed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn auth_failed(&self) -> bool {
        self.auth_failed
    }

    pub fn network_error(&self) -> bool {
        self.network_error
    }
}
