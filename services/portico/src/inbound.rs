//! Inbound listener model.
//!
//! An [`InboundSpec`] is the identity of one protocol listener: two specs
//! with the same type, bind address and origin are the same listener. Specs
//! synthesized from the legacy single-port fields ([`Ports`]) carry
//! `is_from_port_cfg = true`; they take part in reconciliation but are
//! hidden from the public inbound listing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host value meaning "all interfaces" for legacy port listeners.
pub const WILDCARD_HOST: &str = "*";

/// Loopback host used for legacy port listeners when LAN access is off.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Inbound protocol types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundType {
    Http,
    Socks,
    Redir,
    Tproxy,
    Mixed,
}

impl InboundType {
    pub const ALL: [InboundType; 5] = [
        InboundType::Http,
        InboundType::Socks,
        InboundType::Redir,
        InboundType::Tproxy,
        InboundType::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks => "socks",
            Self::Redir => "redir",
            Self::Tproxy => "tproxy",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown inbound type: {0}")]
pub struct UnknownInboundType(pub String);

impl FromStr for InboundType {
    type Err = UnknownInboundType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "socks" | "socks5" => Ok(Self::Socks),
            "redir" => Ok(Self::Redir),
            "tproxy" => Ok(Self::Tproxy),
            "mixed" => Ok(Self::Mixed),
            other => Err(UnknownInboundType(other.to_string())),
        }
    }
}

/// Identity of one protocol listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InboundSpec {
    pub inbound_type: InboundType,
    pub bind_address: String,
    pub is_from_port_cfg: bool,
}

impl InboundSpec {
    /// Spec for an explicitly configured inbound.
    pub fn new(inbound_type: InboundType, bind_address: impl Into<String>) -> Self {
        Self {
            inbound_type,
            bind_address: bind_address.into(),
            is_from_port_cfg: false,
        }
    }

    /// Spec synthesized from a legacy port field.
    pub fn from_port_cfg(inbound_type: InboundType, bind_address: impl Into<String>) -> Self {
        Self {
            inbound_type,
            bind_address: bind_address.into(),
            is_from_port_cfg: true,
        }
    }

    /// Human readable form, e.g. `socks://:1080`.
    pub fn alias(&self) -> String {
        format!("{}://{}", self.inbound_type, self.bind_address)
    }

    /// Port of the bind address; `None` for zero, empty or unparsable ports.
    pub fn port(&self) -> Option<u16> {
        parse_port(&self.bind_address)
    }
}

impl fmt::Display for InboundSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias())
    }
}

/// Legacy single-port-per-protocol configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ports {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub socks_port: u16,
    #[serde(default)]
    pub redir_port: u16,
    #[serde(default)]
    pub tproxy_port: u16,
    #[serde(default)]
    pub mixed_port: u16,
}

impl Ports {
    fn entries(&self) -> [(InboundType, u16); 5] {
        [
            (InboundType::Http, self.port),
            (InboundType::Socks, self.socks_port),
            (InboundType::Redir, self.redir_port),
            (InboundType::Tproxy, self.tproxy_port),
            (InboundType::Mixed, self.mixed_port),
        ]
    }

    /// Legacy inbound specs for every non-zero port.
    pub fn to_inbounds(&self, bind_host: &str, allow_lan: bool) -> Vec<InboundSpec> {
        self.entries()
            .into_iter()
            .filter(|(_, port)| *port != 0)
            .map(|(inbound_type, port)| {
                InboundSpec::from_port_cfg(inbound_type, legacy_bind_address(bind_host, port, allow_lan))
            })
            .collect()
    }
}

/// Listen address for a legacy port listener.
///
/// - LAN allowed, wildcard host: `:port` (all interfaces)
/// - LAN allowed, explicit host: `host:port`
/// - LAN disallowed: `127.0.0.1:port`
pub fn legacy_bind_address(host: &str, port: u16, allow_lan: bool) -> String {
    if !allow_lan {
        return format!("{LOOPBACK_HOST}:{port}");
    }
    if host == WILDCARD_HOST {
        return format!(":{port}");
    }
    if host.contains(':') && !host.starts_with('[') {
        return format!("[{host}]:{port}");
    }
    format!("{host}:{port}")
}

/// Split `host:port`, accepting an empty or bracketed host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    Some((host, port))
}

/// Parse the port of a listen address, rejecting zero and garbage.
pub fn parse_port(addr: &str) -> Option<u16> {
    let (_, port) = split_host_port(addr)?;
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    #[rstest]
    #[case("*", 7890, true, ":7890")]
    #[case("192.168.1.2", 7890, true, "192.168.1.2:7890")]
    #[case("::1", 7890, true, "[::1]:7890")]
    #[case("*", 7890, false, "127.0.0.1:7890")]
    #[case("192.168.1.2", 7890, false, "127.0.0.1:7890")]
    fn test_legacy_bind_address(
        #[case] host: &str,
        #[case] port: u16,
        #[case] allow_lan: bool,
        #[case] expected: &str,
    ) {
        assert_eq!(legacy_bind_address(host, port, allow_lan), expected);
    }

    #[rstest]
    #[case(":1080", Some(1080))]
    #[case("127.0.0.1:7890", Some(7890))]
    #[case("[::1]:53", Some(53))]
    #[case("*:8080", Some(8080))]
    #[case(":0", None)]
    #[case("127.0.0.1:", None)]
    #[case("127.0.0.1", None)]
    #[case("host:http", None)]
    #[case("::1:53", None)]
    #[case(":70000", None)]
    fn test_parse_port(#[case] addr: &str, #[case] expected: Option<u16>) {
        assert_eq!(parse_port(addr), expected);
    }

    #[test]
    fn test_spec_identity_is_by_value() {
        let a = InboundSpec::new(InboundType::Socks, ":1080");
        let b = InboundSpec::new(InboundType::Socks, ":1080");
        let legacy = InboundSpec::from_port_cfg(InboundType::Socks, ":1080");
        let http = InboundSpec::new(InboundType::Http, ":1080");

        let set: HashSet<_> = [a.clone(), b, legacy.clone(), http.clone()].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&a));
        assert!(set.contains(&legacy));
        assert!(set.contains(&http));
    }

    #[test]
    fn test_ports_skip_zero() {
        let ports = Ports {
            port: 7890,
            mixed_port: 7891,
            ..Default::default()
        };
        let inbounds = ports.to_inbounds(WILDCARD_HOST, false);
        assert_eq!(
            inbounds,
            vec![
                InboundSpec::from_port_cfg(InboundType::Http, "127.0.0.1:7890"),
                InboundSpec::from_port_cfg(InboundType::Mixed, "127.0.0.1:7891"),
            ]
        );
    }

    #[test]
    fn test_inbound_type_parse() {
        assert_eq!("SOCKS".parse::<InboundType>().unwrap(), InboundType::Socks);
        assert_eq!("socks5".parse::<InboundType>().unwrap(), InboundType::Socks);
        assert!("tun".parse::<InboundType>().is_err());
        assert_eq!(InboundSpec::new(InboundType::Mixed, ":7890").alias(), "mixed://:7890");
    }
}
