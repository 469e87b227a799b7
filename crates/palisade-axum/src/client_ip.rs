//! Client-IP extraction and trusted-proxy parsing.
//!
//! Forwarded headers are only consulted when the direct peer sits inside a
//! trusted proxy prefix; otherwise a client could spoof its way around the
//! list by sending the header itself.

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;
use tracing::warn;

use palisade_core::config::IpStrategy;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Parses the configured trusted-proxy entries.
///
/// Accepts literal IPs (promoted to `/32` or `/128`), CIDR prefixes, and
/// the keywords `loopback` and `private`. Unparseable entries are skipped
/// with a warning.
#[must_use]
pub fn parse_trusted_proxies(entries: &[String]) -> Vec<IpNet> {
    let mut result = Vec::new();

    for entry in entries {
        match entry.to_ascii_lowercase().as_str() {
            "loopback" => {
                extend_parsed(&mut result, &["127.0.0.0/8", "::1/128"]);
                continue;
            }
            "private" => {
                extend_parsed(
                    &mut result,
                    &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "fc00::/7", "fe80::/10"],
                );
                continue;
            }
            _ => {}
        }

        if let Ok(net) = entry.parse::<IpNet>() {
            result.push(net);
            continue;
        }
        if let Ok(addr) = entry.parse::<IpAddr>() {
            result.push(IpNet::from(addr));
            continue;
        }

        warn!(entry = %entry, "failed to parse trusted proxy entry");
    }

    result
}

fn extend_parsed(result: &mut Vec<IpNet>, prefixes: &[&str]) {
    for prefix in prefixes {
        if let Ok(net) = prefix.parse::<IpNet>() {
            result.push(net);
        }
    }
}

/// Returns `true` if `addr` is inside any trusted proxy prefix.
#[must_use]
pub fn is_trusted_proxy(trusted: &[IpNet], addr: IpAddr) -> bool {
    trusted.iter().any(|net| net.contains(&addr))
}

/// Extracts the client IP for the request per the configured strategy.
///
/// Returns the direct connection address unless the strategy reads a
/// header, the peer is trusted, and the header is present. The result is
/// textual — it may be arbitrary header content, and the access decision
/// rejects anything that does not parse.
#[must_use]
pub fn extract_client_ip(
    strategy: IpStrategy,
    trusted_header: &str,
    trusted_proxies: &[IpNet],
    direct: IpAddr,
    headers: &HeaderMap,
) -> String {
    if strategy == IpStrategy::Direct || trusted_proxies.is_empty() {
        return direct.to_string();
    }

    if !is_trusted_proxy(trusted_proxies, direct) {
        warn!(peer = %direct, "request from untrusted proxy, ignoring headers");
        return direct.to_string();
    }

    let from_header = match strategy {
        IpStrategy::Direct => None,
        IpStrategy::Xff => first_forwarded_entry(headers),
        IpStrategy::RealIp => header_value(headers, X_REAL_IP),
        IpStrategy::Custom => {
            if trusted_header.is_empty() {
                None
            } else {
                header_value(headers, trusted_header)
            }
        }
    };

    from_header.unwrap_or_else(|| direct.to_string())
}

/// First comma-separated entry of `X-Forwarded-For`: the originating client
/// in a well-formed proxy chain.
fn first_forwarded_entry(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(X_FORWARDED_FOR)?.to_str().ok()?;
    let first = value.split(',').next().unwrap_or_default().trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
