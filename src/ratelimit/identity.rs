//! Identity extraction: deriving a rate-limit key from a request.
//!
//! Every extractor yields a non-empty key. When its preferred signal is
//! missing or malformed it falls back to the client address, and when the
//! address is unknown it falls back to [`LOOPBACK_IDENTITY`]. An empty key
//! would merge unrelated callers into one bucket.

use std::net::{IpAddr, SocketAddr};

use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};

/// Address used when no client address can be determined.
pub const LOOPBACK_IDENTITY: &str = "127.0.0.1";

/// Credentials longer than this are keyed on their trailing characters.
const SUBJECT_TAIL_LEN: usize = 32;

/// Resource identifiers shorter than this are not trusted as keys.
const MIN_RESOURCE_ID_LEN: usize = 3;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const CF_CONNECTING_IP: HeaderName = HeaderName::from_static("cf-connecting-ip");

/// The parts of an inbound request that identity extraction reads.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    headers: HeaderMap,
    path: String,
    peer_addr: Option<SocketAddr>,
}

impl RequestContext {
    /// Create a context for a request to `path` with no headers.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Build a context from an `http` request.
    ///
    /// The peer address is read from a [`SocketAddr`] request extension,
    /// which is where connection-aware servers usually leave it.
    pub fn from_request<B>(req: &http::Request<B>) -> Self {
        Self {
            headers: req.headers().clone(),
            path: req.uri().path().to_string(),
            peer_addr: req.extensions().get::<SocketAddr>().copied(),
        }
    }

    /// Add a header. Names or values that are not valid HTTP are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Set the address of the connected peer.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The connected peer, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// How a policy derives an identity key from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityExtractor {
    /// Key on the client network address.
    #[default]
    Address,
    /// Key on the bearer credential, falling back to the address.
    Subject,
    /// Key on the path segment following `marker`, falling back to the
    /// address. All callers acting on one resource share its quota.
    Resource {
        /// Path fragment that precedes the resource identifier, e.g. `/reports/`
        marker: String,
    },
}

impl IdentityExtractor {
    /// Create a resource extractor for the segment after `marker`.
    pub fn resource(marker: impl Into<String>) -> Self {
        IdentityExtractor::Resource {
            marker: marker.into(),
        }
    }

    /// Derive the identity key for `req`.
    pub fn extract(&self, req: &RequestContext) -> String {
        match self {
            IdentityExtractor::Address => address_key(req),
            IdentityExtractor::Subject => subject(req)
                .map(|subject| format!("user:{subject}"))
                .unwrap_or_else(|| address_key(req)),
            IdentityExtractor::Resource { marker } => resource_id(req.path(), marker)
                .map(|id| format!("resource:{id}"))
                .unwrap_or_else(|| address_key(req)),
        }
    }
}

fn address_key(req: &RequestContext) -> String {
    format!("ip:{}", client_address(req))
}

/// Best guess at the client address.
///
/// Forwarding headers win over the socket peer, since behind a proxy the
/// peer is the proxy itself.
pub fn client_address(req: &RequestContext) -> String {
    req.header_str(&X_FORWARDED_FOR)
        .and_then(|chain| chain.split(',').next())
        .and_then(parse_ip)
        .or_else(|| req.header_str(&X_REAL_IP).and_then(parse_ip))
        .or_else(|| req.header_str(&CF_CONNECTING_IP).and_then(parse_ip))
        .or_else(|| req.peer_addr().map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| LOOPBACK_IDENTITY.to_string())
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn subject(req: &RequestContext) -> Option<&str> {
    let (scheme, token) = req.header_str(&AUTHORIZATION)?.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }

    // Header values that pass `to_str` are visible ASCII, so any byte
    // offset is a char boundary.
    Some(&token[token.len().saturating_sub(SUBJECT_TAIL_LEN)..])
}

fn resource_id<'a>(path: &'a str, marker: &str) -> Option<&'a str> {
    if marker.is_empty() {
        return None;
    }

    let start = path.find(marker)? + marker.len();
    let id = path[start..].split(['/', '?', '#']).next()?;

    let plausible = id.len() >= MIN_RESOURCE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    plausible.then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.7:51000".parse().unwrap()
    }

    #[test]
    fn test_address_prefers_first_forwarded_entry() {
        let req = RequestContext::new("/")
            .with_header("x-forwarded-for", " 10.0.0.1 , 172.16.0.1, 192.168.0.1")
            .with_header("x-real-ip", "10.9.9.9")
            .with_peer_addr(peer());

        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:10.0.0.1");
    }

    #[test]
    fn test_address_falls_through_headers_in_order() {
        let req = RequestContext::new("/")
            .with_header("x-real-ip", "10.9.9.9")
            .with_header("cf-connecting-ip", "10.8.8.8");
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:10.9.9.9");

        let req = RequestContext::new("/").with_header("cf-connecting-ip", "10.8.8.8");
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:10.8.8.8");

        let req = RequestContext::new("/").with_peer_addr(peer());
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:192.0.2.7");
    }

    #[test]
    fn test_address_defaults_to_loopback() {
        let req = RequestContext::new("/");
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:127.0.0.1");
    }

    #[test]
    fn test_address_skips_malformed_values() {
        let req = RequestContext::new("/")
            .with_header("x-forwarded-for", "not-an-address, 10.0.0.1")
            .with_header("x-real-ip", "");
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:127.0.0.1");

        let req = RequestContext::new("/")
            .with_header("x-forwarded-for", ",")
            .with_peer_addr(peer());
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:192.0.2.7");
    }

    #[test]
    fn test_address_accepts_ipv6_and_ports() {
        let req = RequestContext::new("/").with_header("x-forwarded-for", "2001:db8::1");
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:2001:db8::1");

        let req = RequestContext::new("/").with_header("x-real-ip", "10.0.0.1:8080");
        assert_eq!(IdentityExtractor::Address.extract(&req), "ip:10.0.0.1");
    }

    #[test]
    fn test_subject_uses_token_tail() {
        let req = RequestContext::new("/")
            .with_header("authorization", "Bearer abc.def.ghi")
            .with_header("x-forwarded-for", "10.0.0.1");
        assert_eq!(IdentityExtractor::Subject.extract(&req), "user:abc.def.ghi");

        let long = "x".repeat(40) + &"y".repeat(32);
        let req = RequestContext::new("/").with_header("authorization", &format!("bearer {long}"));
        assert_eq!(
            IdentityExtractor::Subject.extract(&req),
            format!("user:{}", "y".repeat(32))
        );
    }

    #[test]
    fn test_subject_falls_back_to_address() {
        let req = RequestContext::new("/").with_header("x-forwarded-for", "10.0.0.1");
        assert_eq!(IdentityExtractor::Subject.extract(&req), "ip:10.0.0.1");

        let req = RequestContext::new("/")
            .with_header("authorization", "Basic dXNlcjpwYXNz")
            .with_header("x-forwarded-for", "10.0.0.1");
        assert_eq!(IdentityExtractor::Subject.extract(&req), "ip:10.0.0.1");

        let req = RequestContext::new("/").with_header("authorization", "Bearer ");
        assert_eq!(IdentityExtractor::Subject.extract(&req), "ip:127.0.0.1");
    }

    #[test]
    fn test_resource_uses_segment_after_marker() {
        let extractor = IdentityExtractor::resource("/reports/");

        let req = RequestContext::new("/api/reports/rpt-2041/export");
        assert_eq!(extractor.extract(&req), "resource:rpt-2041");

        let req = RequestContext::new("/api/reports/rpt-2041?format=csv");
        assert_eq!(extractor.extract(&req), "resource:rpt-2041");
    }

    #[test]
    fn test_resource_falls_back_to_address() {
        let extractor = IdentityExtractor::resource("/reports/");
        let with_addr = |path: &str| {
            RequestContext::new(path).with_header("x-forwarded-for", "10.0.0.1")
        };

        assert_eq!(extractor.extract(&with_addr("/api/users/42")), "ip:10.0.0.1");
        assert_eq!(extractor.extract(&with_addr("/api/reports/7")), "ip:10.0.0.1");
        assert_eq!(extractor.extract(&with_addr("/api/reports/")), "ip:10.0.0.1");
        assert_eq!(extractor.extract(&with_addr("/api/reports/a%20b")), "ip:10.0.0.1");
        assert_eq!(
            IdentityExtractor::resource("").extract(&with_addr("/api/reports/abc")),
            "ip:10.0.0.1"
        );
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let req = RequestContext::new("/api/reports/rpt-1")
            .with_header("authorization", "Bearer token-123")
            .with_peer_addr(peer());

        for extractor in [
            IdentityExtractor::Address,
            IdentityExtractor::Subject,
            IdentityExtractor::resource("/reports/"),
        ] {
            let key = extractor.extract(&req);
            assert!(!key.is_empty());
            assert_eq!(extractor.extract(&req), key);
        }
    }

    #[test]
    fn test_from_http_request() {
        let mut req = http::Request::builder()
            .uri("https://example.test/api/reports/rpt-9?x=1")
            .header("x-real-ip", "10.1.2.3")
            .body(())
            .unwrap();
        req.extensions_mut().insert(peer());

        let ctx = RequestContext::from_request(&req);
        assert_eq!(ctx.path(), "/api/reports/rpt-9");
        assert_eq!(ctx.peer_addr(), Some(peer()));
        assert_eq!(IdentityExtractor::Address.extract(&ctx), "ip:10.1.2.3");
    }

    #[test]
    fn test_extractor_from_yaml() {
        let extractor: IdentityExtractor =
            serde_yaml::from_str("kind: resource\nmarker: /exports/\n").unwrap();
        assert_eq!(extractor, IdentityExtractor::resource("/exports/"));

        let extractor: IdentityExtractor = serde_yaml::from_str("kind: subject\n").unwrap();
        assert_eq!(extractor, IdentityExtractor::Subject);
    }
}
