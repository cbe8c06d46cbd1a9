use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::AppState;

/// IP addresses allowed to create secrets. An empty list lets everyone in.
///
/// Forwarding headers are only believed when the socket peer is one of the
/// configured trusted proxies; otherwise the peer address is the client.
#[derive(Debug, Clone, Default)]
pub struct CreationAllowlist {
    ips: Option<Arc<HashSet<IpAddr>>>,
    trusted_proxies: Arc<HashSet<IpAddr>>,
}

impl CreationAllowlist {
    /// Parse a comma-separated list of IP addresses. `None` or blank means open.
    pub fn parse(list: Option<&str>) -> Result<Self> {
        Ok(Self {
            ips: parse_ip_list(list, "creation allow-list")?.map(Arc::new),
            trusted_proxies: Arc::default(),
        })
    }

    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are honoured.
    pub fn with_trusted_proxies(mut self, list: Option<&str>) -> Result<Self> {
        self.trusted_proxies =
            Arc::new(parse_ip_list(list, "trusted proxy list")?.unwrap_or_default());
        Ok(self)
    }

    pub fn is_restricted(&self) -> bool {
        self.ips.is_some()
    }

    pub fn permits(&self, ip: Option<IpAddr>) -> bool {
        match (&self.ips, ip) {
            (None, _) => true,
            (Some(ips), Some(ip)) => ips.contains(&ip),
            (Some(_), None) => false,
        }
    }

    /// The address the allow-list is checked against.
    pub fn client_ip(&self, headers: &HeaderMap, addr: &SocketAddr) -> Option<IpAddr> {
        if self.trusted_proxies.contains(&addr.ip()) {
            forwarded_ip(headers, addr)
        } else {
            Some(addr.ip())
        }
    }
}

fn parse_ip_list(list: Option<&str>, what: &str) -> Result<Option<HashSet<IpAddr>>> {
    let Some(list) = list.filter(|l| !l.trim().is_empty()) else {
        return Ok(None);
    };
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .with_context(|| format!("invalid IP address in {what}: {s}"))
        })
        .collect::<Result<HashSet<_>>>()
        .map(Some)
}

/// Client IP as reported by a proxy: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer.
fn forwarded_ip(headers: &HeaderMap, addr: &SocketAddr) -> Option<IpAddr> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.parse().ok();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.parse().ok();
        }
    }
    Some(addr.ip())
}

/// Axum middleware guarding secret creation with the allow-list.
pub async fn require_allowed_creator(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = state.creation_allowlist.client_ip(request.headers(), &addr);
    if state.creation_allowlist.permits(ip) {
        return next.run(request).await;
    }

    debug!(ip = ?ip, "secret creation refused by allow-list");
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "you are not allowed to create secrets"})),
    )
        .into_response()
}
