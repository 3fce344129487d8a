//! Address extraction from free-form log lines

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

/// Dotted quad with an optional `:port` suffix
static ADDRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d+)?\b").expect("address pattern is valid")
});

/// Prefixes never worth tracking (loopback and unspecified)
const IGNORED_PREFIXES: [&str; 2] = ["127.", "0."];

/// Every routable-looking IPv4 address in `line`, ports stripped, in order
/// of appearance. Zero-padded octets are normalised (`093.184.216.034` is
/// `93.184.216.34`); addresses with an octet above 255 are dropped.
pub fn extract_addresses(line: &str) -> Vec<String> {
    ADDRESS_PATTERN
        .find_iter(line)
        .filter_map(|m| normalize(strip_port(m.as_str())))
        .filter(|ip| !IGNORED_PREFIXES.iter().any(|prefix| ip.starts_with(prefix)))
        .collect()
}

/// Canonical dotted quad, or `None` if an octet is out of range
fn normalize(candidate: &str) -> Option<String> {
    let mut octets = [0u8; 4];
    let mut parts = candidate.split('.');
    for octet in octets.iter_mut() {
        *octet = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets).to_string())
}

fn strip_port(candidate: &str) -> &str {
    match candidate.split_once(':') {
        Some((ip, _port)) => ip,
        None => candidate,
    }
}
