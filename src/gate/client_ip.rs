//! Client IP resolution for the gate.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr};

/// Headers consulted, in order, when proxy headers are trusted.
const PROXY_HEADERS: &[&str] = &["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Used when no candidate parses as an IP.
pub const UNKNOWN_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Resolve the client IP.
///
/// With `trust_proxy` set, checks `X-Forwarded-For` (first entry),
/// `X-Real-IP`, then `CF-Connecting-IP`. Falls back to the socket peer.
/// A candidate that does not parse is skipped.
pub fn resolve_client_ip(headers: &HeaderMap, remote: Option<IpAddr>, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        for name in PROXY_HEADERS {
            let candidate = headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .and_then(|v| v.parse::<IpAddr>().ok());
            if let Some(ip) = candidate {
                return ip;
            }
        }
    }

    remote.unwrap_or(UNKNOWN_IP)
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
