pub mod transport;

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::{self, Deserialize, Deserializer};

use crate::error::WardenError;

/// Wire protocol used to reach an upstream resolver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum UpstreamProtocol {
    /// Classic DNS: UDP with TCP fallback.
    #[default]
    PlainDns,
    /// DNS over TLS (RFC 7858).
    Tls,
    /// DNS over HTTPS (RFC 8484).
    Https,
}

impl UpstreamProtocol {
    pub fn default_port(&self) -> u16 {
        match self {
            UpstreamProtocol::PlainDns => 53,
            UpstreamProtocol::Tls => 853,
            UpstreamProtocol::Https => 443,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            UpstreamProtocol::PlainDns => "tcp+udp",
            UpstreamProtocol::Tls => "tcp-tls",
            UpstreamProtocol::Https => "https",
        }
    }
}

/// An external DNS server queries are forwarded to.
///
/// Parsed from `[proto:]host[:port][/path][#commonname]` or from a DNS Stamp
/// (`sdns://…`). Equality covers every field; the default value means
/// "unset".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub protocol: UpstreamProtocol,
    pub host: String,
    pub port: u16,
    /// HTTP path for DoH endpoints, empty otherwise.
    pub path: String,
    /// TLS name to verify instead of `host`.
    pub common_name: Option<String>,
    /// Hex-encoded SHA-256 fingerprints of acceptable certificates.
    pub fingerprints: Vec<String>,
}

impl Upstream {
    pub fn is_unset(&self) -> bool {
        self.host.is_empty()
    }

    /// Name presented during TLS verification.
    pub fn tls_name(&self) -> &str {
        self.common_name.as_deref().unwrap_or(&self.host)
    }

    pub fn doh_url(&self) -> String {
        let path = if self.path.is_empty() { "/dns-query" } else { &self.path };
        format!("https://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        write!(f, "{}:{}:{}", self.protocol.prefix(), host, self.port)?;
        if !self.path.is_empty() {
            write!(f, "{}", self.path)?;
        }
        if let Some(cn) = &self.common_name {
            write!(f, "#{}", cn)?;
        }
        Ok(())
    }
}

impl FromStr for Upstream {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(WardenError::InvalidUpstream("empty upstream".into()));
        }
        if let Some(stamp) = s.strip_prefix("sdns://") {
            return parse_stamp(stamp);
        }

        let (protocol, rest) = if let Some(rest) = s.strip_prefix("tcp+udp:") {
            (UpstreamProtocol::PlainDns, rest)
        } else if let Some(rest) = s.strip_prefix("tcp-tls:") {
            (UpstreamProtocol::Tls, rest)
        } else if let Some(rest) = s.strip_prefix("https:") {
            (UpstreamProtocol::Https, rest)
        } else {
            (UpstreamProtocol::PlainDns, s)
        };
        // Tolerate URL style for DoH ("https://dns.example/dns-query").
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (rest, common_name) = match rest.split_once('#') {
            Some((head, cn)) if !cn.is_empty() => (head, Some(cn.to_string())),
            Some((head, _)) => (head, None),
            None => (rest, None),
        };

        // Split off the DoH path; IPv6 literals are bracketed so the first
        // '/' after the authority starts the path.
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };
        if !path.is_empty() && protocol != UpstreamProtocol::Https {
            return Err(WardenError::InvalidUpstream(format!(
                "path is only valid for https upstreams: {}",
                s
            )));
        }

        let (host, port) = parse_authority(authority)
            .ok_or_else(|| WardenError::InvalidUpstream(format!("invalid host in {}", s)))?;

        Ok(Upstream {
            protocol,
            host,
            port: port.unwrap_or_else(|| protocol.default_port()),
            path,
            common_name,
            fingerprints: Vec::new(),
        })
    }
}

impl<'de> Deserialize<'de> for Upstream {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

fn parse_authority(authority: &str) -> Option<(String, Option<u16>)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    if authority.matches(':').count() > 1 {
        // Unbracketed IPv6 literal, no port.
        return authority.parse::<std::net::Ipv6Addr>().ok().map(|ip| (ip.to_string(), None));
    }
    match authority.split_once(':') {
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((authority.to_string(), None)),
    }
}

// DNS Stamp field readers (draft-dnscrypt-stamps): length-prefixed values,
// the high bit on a length marks "more values follow" in a set.
struct StampReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StampReader<'a> {
    fn u8(&mut self) -> Result<u8, WardenError> {
        let v = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| WardenError::InvalidUpstream("truncated DNS stamp".into()))?;
        self.pos += 1;
        Ok(v)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WardenError> {
        if self.pos + len > self.buf.len() {
            return Err(WardenError::InvalidUpstream("truncated DNS stamp".into()));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn lp_string(&mut self) -> Result<String, WardenError> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| WardenError::InvalidUpstream("invalid UTF-8 in DNS stamp".into()))
    }

    fn vlp_set(&mut self) -> Result<Vec<Vec<u8>>, WardenError> {
        let mut values = Vec::new();
        loop {
            let len = self.u8()?;
            let more = len & 0x80 != 0;
            let value = self.bytes((len & 0x7F) as usize)?.to_vec();
            if !value.is_empty() {
                values.push(value);
            }
            if !more {
                break;
            }
        }
        Ok(values)
    }
}

fn parse_stamp(encoded: &str) -> Result<Upstream, WardenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| WardenError::InvalidUpstream(format!("invalid DNS stamp encoding: {}", e)))?;
    let mut reader = StampReader { buf: &raw, pos: 0 };

    let kind = reader.u8()?;
    // 8 bytes of properties (DNSSEC / no-log / no-filter), not used here.
    reader.bytes(8)?;

    match kind {
        // Plain DNS
        0x00 => {
            let addr = reader.lp_string()?;
            let (host, port) = parse_authority(&addr)
                .ok_or_else(|| WardenError::InvalidUpstream("stamp without address".into()))?;
            Ok(Upstream {
                protocol: UpstreamProtocol::PlainDns,
                host,
                port: port.unwrap_or(53),
                ..Upstream::default()
            })
        }
        // DNS over HTTPS
        0x02 => {
            let _addr = reader.lp_string()?;
            let hashes = reader.vlp_set()?;
            let hostname = reader.lp_string()?;
            let path = reader.lp_string()?;
            let (host, port) = parse_authority(&hostname)
                .ok_or_else(|| WardenError::InvalidUpstream("stamp without hostname".into()))?;
            Ok(Upstream {
                protocol: UpstreamProtocol::Https,
                host,
                port: port.unwrap_or(443),
                path,
                common_name: None,
                fingerprints: hashes.iter().map(hex::encode).collect(),
            })
        }
        // DNS over TLS
        0x03 => {
            let addr = reader.lp_string()?;
            let hashes = reader.vlp_set()?;
            let hostname = reader.lp_string()?;
            let (tls_host, tls_port) = parse_authority(&hostname)
                .ok_or_else(|| WardenError::InvalidUpstream("stamp without hostname".into()))?;
            // Prefer the bootstrap address for the connection, keep the
            // hostname for certificate verification.
            let (host, port, common_name) = match parse_authority(&addr) {
                Some((ip, addr_port)) if !addr.is_empty() => {
                    (ip, addr_port.or(tls_port), Some(tls_host))
                }
                _ => (tls_host, tls_port, None),
            };
            Ok(Upstream {
                protocol: UpstreamProtocol::Tls,
                host,
                port: port.unwrap_or(853),
                path: String::new(),
                common_name,
                fingerprints: hashes.iter().map(hex::encode).collect(),
            })
        }
        0x01 => Err(WardenError::InvalidUpstream("DNSCrypt stamps are not supported".into())),
        0x04 => Err(WardenError::InvalidUpstream("DoQ stamps are not supported".into())),
        0x05 => Err(WardenError::InvalidUpstream("ODoH stamps are not supported".into())),
        other => Err(WardenError::InvalidUpstream(format!("unknown DNS stamp type {:#04x}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let u: Upstream = "1.1.1.1".parse().unwrap();
        assert_eq!(u.protocol, UpstreamProtocol::PlainDns);
        assert_eq!(u.host, "1.1.1.1");
        assert_eq!(u.port, 53);
    }

    #[test]
    fn parses_tls_with_port_and_common_name() {
        let u: Upstream = "tcp-tls:dns.example.com:8853#verify.example.com".parse().unwrap();
        assert_eq!(u.protocol, UpstreamProtocol::Tls);
        assert_eq!(u.port, 8853);
        assert_eq!(u.common_name.as_deref(), Some("verify.example.com"));
        assert_eq!(u.tls_name(), "verify.example.com");
    }

    #[test]
    fn parses_doh_url_style() {
        let u: Upstream = "https://dns.example.com/dns-query".parse().unwrap();
        assert_eq!(u.protocol, UpstreamProtocol::Https);
        assert_eq!(u.port, 443);
        assert_eq!(u.path, "/dns-query");
        assert_eq!(u.doh_url(), "https://dns.example.com:443/dns-query");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let u: Upstream = "tcp+udp:[2001:db8::1]:5353".parse().unwrap();
        assert_eq!(u.host, "2001:db8::1");
        assert_eq!(u.port, 5353);
    }

    #[test]
    fn rejects_path_on_plain_dns() {
        assert!("tcp+udp:1.1.1.1/x".parse::<Upstream>().is_err());
    }

    #[test]
    fn canonical_form_roundtrips() {
        for raw in [
            "tcp+udp:8.8.8.8:53",
            "tcp-tls:dns.example.com:853#pin.example.com",
            "https:dns.example.com:443/dns-query",
            "tcp+udp:[2001:db8::1]:53",
        ] {
            let parsed: Upstream = raw.parse().unwrap();
            let reparsed: Upstream = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed);
            assert_eq!(parsed.to_string(), raw);
        }
    }

    fn make_stamp(parts: &[&[u8]]) -> String {
        let mut raw = Vec::new();
        for part in parts {
            raw.extend_from_slice(part);
        }
        format!("sdns://{}", URL_SAFE_NO_PAD.encode(raw))
    }

    #[test]
    fn parses_plain_stamp() {
        // type 0x00, props, lp("9.9.9.9:53")
        let addr = b"9.9.9.9:53";
        let stamp = make_stamp(&[&[0x00], &[0u8; 8], &[addr.len() as u8], addr]);
        let u: Upstream = stamp.parse().unwrap();
        assert_eq!(u.protocol, UpstreamProtocol::PlainDns);
        assert_eq!(u.host, "9.9.9.9");
        assert_eq!(u.port, 53);
    }

    #[test]
    fn parses_dot_stamp_with_hash() {
        let addr = b"9.9.9.9";
        let hash = [0xABu8; 32];
        let host = b"dns.quad9.net";
        let stamp = make_stamp(&[
            &[0x03],
            &[0u8; 8],
            &[addr.len() as u8],
            addr,
            &[hash.len() as u8],
            &hash,
            &[host.len() as u8],
            host,
        ]);
        let u: Upstream = stamp.parse().unwrap();
        assert_eq!(u.protocol, UpstreamProtocol::Tls);
        assert_eq!(u.host, "9.9.9.9");
        assert_eq!(u.port, 853);
        assert_eq!(u.common_name.as_deref(), Some("dns.quad9.net"));
        assert_eq!(u.fingerprints, vec![hex::encode(hash)]);
    }

    #[test]
    fn parses_doh_stamp() {
        let hash = [0x11u8; 32];
        let host = b"cloudflare-dns.com";
        let path = b"/dns-query";
        let stamp = make_stamp(&[
            &[0x02],
            &[0u8; 8],
            &[0], // empty addr
            &[hash.len() as u8],
            &hash,
            &[host.len() as u8],
            host,
            &[path.len() as u8],
            path,
        ]);
        let u: Upstream = stamp.parse().unwrap();
        assert_eq!(u.protocol, UpstreamProtocol::Https);
        assert_eq!(u.host, "cloudflare-dns.com");
        assert_eq!(u.path, "/dns-query");
    }

    #[test]
    fn rejects_unsupported_stamp_kinds() {
        for kind in [0x01u8, 0x04, 0x05] {
            let stamp = make_stamp(&[&[kind], &[0u8; 8], &[0]]);
            assert!(stamp.parse::<Upstream>().is_err(), "kind {:#04x}", kind);
        }
    }
}
