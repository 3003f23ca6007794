//! Client IP derivation from forwarded headers
//!
//! The gateway usually sits behind one or more reverse proxies, so the remote
//! socket address is rarely the real client. Forwarded headers are only
//! honored when the socket address belongs to a configured trusted-proxy
//! CIDR; otherwise a client could spoof its way past IP policy checks.
//!
//! Resolution order:
//! 1. `cf-connecting-ip` when the socket is a trusted proxy and the value is public
//! 2. `x-real-ip` when public
//! 3. First public entry of `x-forwarded-for`, else its first entry
//! 4. The socket address itself
//!
//! Resolution never fails; an unresolvable address yields an empty value and
//! the downstream gates decide what that means.

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use ipnet::IpNet;
use tracing::trace;

use crate::pipeline::GatewayState;

/// The derived client IP, attached to every request's extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

/// Parse a CIDR, falling back to a single-host network for bare IP literals
pub fn parse_cidr_or_ip(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    s.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Strip the IPv4-mapped-IPv6 prefix (`::ffff:a.b.c.d` becomes `a.b.c.d`)
fn normalize(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

/// Whether an address is publicly routable.
///
/// Private (RFC 1918 / ULA fd00::/8), loopback, link-local, reserved and
/// multicast ranges are all non-public.
pub fn is_public(ip: &IpAddr) -> bool {
    match normalize(*ip) {
        IpAddr::V4(v4) => {
            // 240.0.0.0/4, reserved for future use
            let is_reserved = v4.octets()[0] & 0xf0 == 0xf0 && !v4.is_broadcast();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
                || is_reserved)
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            let is_ula = (seg[0] & 0xff00) == 0xfd00;
            let is_link_local = (seg[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_ula
                || is_link_local)
        }
    }
}

/// Whether an address is internal traffic (private, loopback or link-local).
///
/// The policy gate passes these without consulting any list.
pub fn is_private_or_local(ip: &IpAddr) -> bool {
    match normalize(*ip) {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback() || (seg[0] & 0xff00) == 0xfd00 || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Parse a header value as an IP and keep it only if public
fn public_candidate(value: &str) -> Option<IpAddr> {
    let ip = value.parse::<IpAddr>().ok()?;
    let ip = normalize(ip);
    is_public(&ip).then_some(ip)
}

/// Derive the client IP for a request.
///
/// `remote` is the peer socket address; `trusted` identifies upstream proxies
/// whose `cf-connecting-ip` may be honored.
pub fn resolve_client_ip(
    remote: Option<IpAddr>,
    headers: &HeaderMap,
    trusted: &[IpNet],
) -> Option<IpAddr> {
    let remote = remote.map(normalize);

    // 1. cf-connecting-ip, only behind a trusted proxy
    if let Some(socket_ip) = remote {
        let from_trusted = trusted.iter().any(|net| net.contains(&socket_ip));
        if from_trusted {
            if let Some(ip) = header_value(headers, "cf-connecting-ip").and_then(public_candidate)
            {
                return Some(ip);
            }
        }
    }

    // 2. x-real-ip when public
    if let Some(ip) = header_value(headers, "x-real-ip").and_then(public_candidate) {
        return Some(ip);
    }

    // 3. x-forwarded-for: first public entry, else the first entry
    if let Some(xff) = header_value(headers, "x-forwarded-for") {
        let entries: Vec<&str> = xff.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        for entry in &entries {
            if let Some(ip) = public_candidate(entry) {
                return Some(ip);
            }
        }
        if let Some(first) = entries.first() {
            return first.parse::<IpAddr>().ok().map(normalize);
        }
    }

    // 4. Fall back to the socket address
    remote
}

/// First pipeline stage: derive the client IP and attach the per-request
/// context (client IP + shared store handle) before any gate runs.
pub async fn client_context_middleware(
    State(state): State<GatewayState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let client_ip = resolve_client_ip(
        Some(remote.ip()),
        request.headers(),
        state.trusted_proxies(),
    );
    trace!(socket = %remote.ip(), client_ip = ?client_ip, "resolved client IP");

    request.extensions_mut().insert(ClientIp(client_ip));
    request.extensions_mut().insert(state.store.clone());

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn trusted() -> Vec<IpNet> {
        vec!["10.0.0.0/8".parse().unwrap(), "127.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn test_cf_connecting_ip_from_trusted_proxy() {
        let ip = resolve_client_ip(
            Some("10.0.0.1".parse().unwrap()),
            &headers(&[("cf-connecting-ip", "203.0.114.9")]),
            &trusted(),
        );
        assert_eq!(ip, Some("203.0.114.9".parse().unwrap()));
    }

    #[test]
    fn test_cf_connecting_ip_ignored_from_untrusted_socket() {
        let ip = resolve_client_ip(
            Some("8.8.8.8".parse().unwrap()),
            &headers(&[("cf-connecting-ip", "203.0.114.9")]),
            &trusted(),
        );
        // Untrusted socket: header skipped, socket address wins
        assert_eq!(ip, Some("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_private_cf_connecting_ip_skipped() {
        let ip = resolve_client_ip(
            Some("10.0.0.1".parse().unwrap()),
            &headers(&[
                ("cf-connecting-ip", "192.168.1.5"),
                ("x-real-ip", "198.51.100.7"),
            ]),
            &trusted(),
        );
        assert_eq!(ip, Some("198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn test_xff_first_public_entry() {
        let ip = resolve_client_ip(
            Some("10.0.0.1".parse().unwrap()),
            &headers(&[("x-forwarded-for", "192.168.0.9, 203.0.114.4, 10.0.0.2")]),
            &trusted(),
        );
        assert_eq!(ip, Some("203.0.114.4".parse().unwrap()));
    }

    #[test]
    fn test_xff_reserved_entry_not_treated_as_public() {
        let ip = resolve_client_ip(
            Some("10.0.0.1".parse().unwrap()),
            &headers(&[("x-forwarded-for", "240.1.2.3, 203.0.114.4")]),
            &trusted(),
        );
        assert_eq!(ip, Some("203.0.114.4".parse().unwrap()));
    }

    #[test]
    fn test_xff_all_private_falls_back_to_first() {
        let ip = resolve_client_ip(
            Some("10.0.0.1".parse().unwrap()),
            &headers(&[("x-forwarded-for", "192.168.0.9, 10.0.5.7")]),
            &trusted(),
        );
        assert_eq!(ip, Some("192.168.0.9".parse().unwrap()));
    }

    #[test]
    fn test_xff_garbage_first_entry_yields_none() {
        let ip = resolve_client_ip(
            None,
            &headers(&[("x-forwarded-for", "unknown, 192.168.0.9")]),
            &trusted(),
        );
        assert_eq!(ip, None);
    }

    #[test]
    fn test_no_headers_uses_socket() {
        let ip = resolve_client_ip(
            Some("203.0.113.10".parse().unwrap()),
            &HeaderMap::new(),
            &trusted(),
        );
        assert_eq!(ip, Some("203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn test_no_headers_no_socket_is_empty() {
        assert_eq!(resolve_client_ip(None, &HeaderMap::new(), &trusted()), None);
    }

    #[test]
    fn test_ipv4_mapped_ipv6_normalized() {
        let ip = resolve_client_ip(
            Some("::ffff:203.0.113.9".parse().unwrap()),
            &HeaderMap::new(),
            &trusted(),
        );
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))));
    }

    #[test]
    fn test_is_public() {
        assert!(is_public(&"8.8.8.8".parse().unwrap()));
        assert!(is_public(&"2606:4700::1111".parse().unwrap()));
        assert!(!is_public(&"10.1.2.3".parse().unwrap()));
        assert!(!is_public(&"172.16.0.1".parse().unwrap()));
        assert!(!is_public(&"192.168.1.1".parse().unwrap()));
        assert!(!is_public(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public(&"169.254.1.1".parse().unwrap()));
        assert!(!is_public(&"224.0.0.1".parse().unwrap()));
        assert!(!is_public(&"240.1.2.3".parse().unwrap()));
        assert!(!is_public(&"255.255.255.255".parse().unwrap()));
        assert!(!is_public(&"::1".parse().unwrap()));
        assert!(!is_public(&"fd12::1".parse().unwrap()));
        assert!(!is_public(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_is_private_or_local() {
        assert!(is_private_or_local(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_or_local(&"127.0.0.1".parse().unwrap()));
        assert!(is_private_or_local(&"fe80::1".parse().unwrap()));
        assert!(!is_private_or_local(&"203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_parse_cidr_or_ip() {
        assert!(parse_cidr_or_ip("10.0.0.0/8").is_some());
        assert!(parse_cidr_or_ip("10.0.0.1").is_some());
        assert!(parse_cidr_or_ip("fe80::/10").is_some());
        assert!(parse_cidr_or_ip("not-an-ip").is_none());
    }
}
