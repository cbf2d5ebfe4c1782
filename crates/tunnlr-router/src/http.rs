//! HTTP host handling

use std::net::IpAddr;

/// Normalize a Host header value: strip the port and lower-case.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    // Bracketed IPv6 literal, e.g. "[::1]:8080"
    if let Some(rest) = host.strip_prefix('[') {
        return rest
            .split(']')
            .next()
            .unwrap_or(rest)
            .to_ascii_lowercase();
    }

    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// First label of a host with at least three dot-separated labels.
///
/// Returns `None` when the host has fewer labels, an empty first label, or is an IP literal.
pub fn subdomain_of(host: &str) -> Option<String> {
    let host = normalize_host(host);
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let labels: Vec<&str> = host.split('.').collect();

    if labels.len() < 3 {
        return None;
    }

    let first = labels[0];
    if first.is_empty() {
        return None;
    }

    Some(first.to_string())
}
