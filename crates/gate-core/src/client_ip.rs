use std::collections::HashMap;
use std::net::IpAddr;

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const UNKNOWN_IP: &str = "unknown";

/// A header as the host framework hands it over: once, or repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    fn first(&self) -> Option<&str> {
        match self {
            HeaderValue::Single(value) => Some(value.as_str()),
            HeaderValue::Multi(values) => values.first().map(String::as_str),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Single(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        HeaderValue::Multi(values)
    }
}

/// What the rate limiter needs to know about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Client IP already decided by the host framework or a trusted upstream.
    pub ip: Option<String>,
    /// Keys are lowercased header names.
    pub headers: HashMap<String, HeaderValue>,
    /// Remote address of the socket.
    pub peer_addr: Option<IpAddr>,
}

impl InboundRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    fn direct_ip(&self) -> Option<String> {
        self.ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    }

    fn forwarded_for(&self) -> Option<String> {
        self.header(FORWARDED_FOR)
            .and_then(HeaderValue::first)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    }
}

/// Picks the address a request is counted against.
///
/// With `trust_proxy` the directly supplied IP and then the socket peer are
/// authoritative and `x-forwarded-for` is ignored. Without it the first
/// `x-forwarded-for` entry wins, then the direct IP, then the peer.
pub fn resolve_client_ip(req: &InboundRequest, trust_proxy: bool) -> Option<String> {
    let peer = || req.peer_addr.map(|addr| addr.to_string());
    if trust_proxy {
        req.direct_ip().or_else(peer)
    } else {
        req.forwarded_for()
            .or_else(|| req.direct_ip())
            .or_else(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn proxied() -> InboundRequest {
        InboundRequest::new()
            .with_ip("9.8.7.6")
            .with_header("X-Forwarded-For", "1.2.3.4, 5.6.7.8")
            .with_peer_addr(IpAddr::from_str("10.0.0.1").unwrap())
    }

    #[test]
    fn forwarded_header_wins_by_default() {
        assert_eq!(resolve_client_ip(&proxied(), false).as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn trusted_proxy_prefers_direct_ip() {
        assert_eq!(resolve_client_ip(&proxied(), true).as_deref(), Some("9.8.7.6"));
    }

    #[test]
    fn trusted_proxy_falls_back_to_peer() {
        let mut req = proxied();
        req.ip = None;
        assert_eq!(resolve_client_ip(&req, true).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn multi_value_header_uses_first_entry() {
        let req = InboundRequest::new().with_header(
            FORWARDED_FOR,
            vec![" 203.0.113.7 , 10.1.1.1".to_string(), "198.51.100.2".to_string()],
        );
        assert_eq!(resolve_client_ip(&req, false).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn untrusted_falls_through_to_direct_then_peer() {
        let req = InboundRequest::new().with_ip("9.8.7.6");
        assert_eq!(resolve_client_ip(&req, false).as_deref(), Some("9.8.7.6"));

        let req = InboundRequest::new()
            .with_header(FORWARDED_FOR, "  ")
            .with_ip("")
            .with_peer_addr(IpAddr::from_str("::1").unwrap());
        assert_eq!(resolve_client_ip(&req, false).as_deref(), Some("::1"));
    }

    #[test]
    fn nothing_to_go_on() {
        assert_eq!(resolve_client_ip(&InboundRequest::new(), false), None);
        assert_eq!(resolve_client_ip(&InboundRequest::new(), true), None);
        let req = InboundRequest::new().with_header(FORWARDED_FOR, Vec::<String>::new());
        assert_eq!(resolve_client_ip(&req, false), None);
    }
}
