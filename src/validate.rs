//! Inbound and redirect URL gating.
//!
//! Every URL the fetcher might contact passes through [`validate_url`],
//! including each hop of a redirect chain. The gates run in a fixed order so
//! a given URL always fails with the same code.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::{ErrorCode, ProxyError};

pub const MAX_URL_LENGTH: usize = 4096;

/// Applies the upstream-safety gates, in order: non-empty, length, parse,
/// HTTPS, embedded credentials, private host, domain allowlist.
pub fn validate_url(raw: &str, allowed_hosts: &HashSet<String>) -> Result<(), ProxyError> {
    if raw.is_empty() {
        return Err(ProxyError::new(
            400,
            ErrorCode::MissingUrl,
            "url parameter is required",
        ));
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(ProxyError::new(
            400,
            ErrorCode::UrlTooLong,
            format!("url exceeds {MAX_URL_LENGTH} characters"),
        ));
    }
    let parsed = Url::parse(raw)
        .map_err(|_| ProxyError::new(400, ErrorCode::InvalidUrl, "url is not parseable"))?;
    if parsed.scheme() != "https" {
        return Err(ProxyError::new(
            400,
            ErrorCode::HttpsRequired,
            "only https urls are accepted",
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(ProxyError::new(
            400,
            ErrorCode::CredentialsInUrl,
            "urls with embedded credentials are rejected",
        ));
    }
    let host = match parsed.host() {
        Some(h) => h,
        None => {
            return Err(ProxyError::new(
                400,
                ErrorCode::InvalidUrl,
                "url has no host",
            ))
        }
    };
    if host_is_private(&host) {
        return Err(ProxyError::new(
            403,
            ErrorCode::PrivateHost,
            "url resolves to a private or reserved host",
        ));
    }
    let hostname = match &host {
        Host::Domain(d) => d.to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    if !allowed_hosts.contains(&hostname) {
        return Err(ProxyError::new(
            403,
            ErrorCode::DomainNotAllowed,
            format!("host {hostname} is not in the allowed domain list"),
        ));
    }
    Ok(())
}

fn host_is_private(host: &Host<&str>) -> bool {
    match host {
        Host::Ipv4(ip) => ipv4_is_private(*ip),
        Host::Ipv6(ip) => ipv6_is_private(ip),
        Host::Domain(d) => domain_is_private(d),
    }
}

fn domain_is_private(domain: &str) -> bool {
    let name = domain.trim_end_matches('.').to_ascii_lowercase();
    if name == "localhost" || name.ends_with(".local") || name.ends_with(".internal") {
        return true;
    }
    // A dotted-decimal host that the URL parser left as a domain still gets
    // the strict IPv4 treatment.
    if let Some(ip) = parse_strict_ipv4(&name) {
        return ipv4_is_private(ip);
    }
    false
}

/// Strict dotted-decimal IPv4 parse: exactly four decimal octets, no leading
/// zeros, no hex or octal forms. Anything looser opens the classic
/// `0177.0.0.1` bypass.
pub fn parse_strict_ipv4(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in s.split('.') {
        if count == 4 {
            return None;
        }
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        let value: u16 = part.parse().ok()?;
        if value > 255 {
            return None;
        }
        octets[count] = value as u8;
        count += 1;
    }
    if count != 4 {
        return None;
    }
    Some(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

fn ipv4_is_private(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    match a {
        0 => true,                                  // 0.0.0.0/8
        10 => true,                                 // 10.0.0.0/8
        100 if (64..=127).contains(&b) => true,     // 100.64.0.0/10
        127 => true,                                // 127.0.0.0/8
        169 if b == 254 => true,                    // 169.254.0.0/16
        172 if (16..=31).contains(&b) => true,      // 172.16.0.0/12
        192 if b == 0 && c == 0 => true,            // 192.0.0.0/24
        192 if b == 0 && c == 2 => true,            // 192.0.2.0/24
        192 if b == 168 => true,                    // 192.168.0.0/16
        198 if b == 18 || b == 19 => true,          // 198.18.0.0/15
        198 if b == 51 && c == 100 => true,         // 198.51.100.0/24
        203 if b == 0 && c == 113 => true,          // 203.0.113.0/24
        224..=255 => true,                          // 224.0.0.0/4 + 240.0.0.0/4
        _ => false,
    }
}

fn ipv6_is_private(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let seg0 = ip.segments()[0];
    if (seg0 & 0xfe00) == 0xfc00 {
        return true; // fc00::/7 unique-local
    }
    if (seg0 & 0xffc0) == 0xfe80 {
        return true; // fe80::/10 link-local
    }
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return ipv4_is_private(mapped);
    }
    false
}
