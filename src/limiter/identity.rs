use reqwest::header::HeaderMap;
use std::net::{IpAddr, SocketAddr};

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const REAL_IP: &str = "x-real-ip";

/// The unit a quota is tracked against.
///
/// Precedence: authenticated user id, then the first address in the
/// forwarding chain, then `x-real-ip`, then [`Identity::Unknown`]. Callers
/// without any of these (e.g. behind one NAT without forwarding headers)
/// share the `unknown` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    Ip(IpAddr),
    Unknown,
}

impl Identity {
    pub fn resolve(user_id: Option<&str>, headers: &HeaderMap) -> Self {
        if let Some(user) = user_id.map(str::trim).filter(|u| !u.is_empty()) {
            return Identity::User(user.to_string());
        }
        client_ip(headers)
            .map(Identity::Ip)
            .unwrap_or(Identity::Unknown)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Identity::User(id.into())
    }

    /// Stable component of the limiter storage key.
    pub fn as_key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{}", id),
            Identity::Ip(ip) => format!("ip:{}", ip),
            Identity::Unknown => "unknown".to_string(),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .and_then(parse_addr);
    forwarded.or_else(|| {
        headers
            .get(REAL_IP)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_addr)
    })
}

fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
}
