//! Destination addresses and port selectors.

use crate::error::{ProxyError, ProxyResult};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Port value that means "keep the client's port" (as target) or "any
/// port" (as match) when given in configuration.
pub const PORT_SENTINEL: u16 = 0;

/// An (IP, port) pair identifying a proxy destination.
///
/// Values are immutable; every rewrite step builds a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpec {
    pub ip: IpAddr,
    pub port: u16,
}

impl AddressSpec {
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn with_ip(self, ip: IpAddr) -> Self {
        Self { ip, ..self }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Parse `ip:port` (or `[ip6]:port`). Host names are rejected: only IP
    /// targets are supported.
    pub fn parse(s: &str) -> ProxyResult<Self> {
        s.parse()
    }
}

impl FromStr for AddressSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|e| ProxyError::RewriteConfig(format!("invalid address {s:?}: {e}")))
    }
}

impl From<SocketAddr> for AddressSpec {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// A client's CONNECT request as seen by the rewriting pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Destination after name resolution.
    pub dest: AddressSpec,
    /// Domain name the client asked for, if it sent one.
    pub fqdn: Option<String>,
    /// The client's own address.
    pub client: Option<SocketAddr>,
}

impl Request {
    pub fn new(dest: AddressSpec) -> Self {
        Self {
            dest,
            fqdn: None,
            client: None,
        }
    }

    pub fn with_fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.fqdn = Some(fqdn.into());
        self
    }

    pub fn with_client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }
}

/// Which port a rewrite produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTarget {
    /// Keep the port from the client's request.
    Preserve,
    Port(u16),
}

impl PortTarget {
    pub fn apply(self, requested: u16) -> u16 {
        match self {
            PortTarget::Preserve => requested,
            PortTarget::Port(p) => p,
        }
    }
}

impl From<u16> for PortTarget {
    fn from(port: u16) -> Self {
        if port == PORT_SENTINEL {
            PortTarget::Preserve
        } else {
            PortTarget::Port(port)
        }
    }
}

impl FromStr for PortTarget {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_port(s).map(Self::from)
    }
}

/// Which requested ports a rewrite applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMatch {
    Any,
    Port(u16),
}

impl PortMatch {
    pub fn matches(self, requested: u16) -> bool {
        match self {
            PortMatch::Any => true,
            PortMatch::Port(p) => p == requested,
        }
    }
}

impl From<u16> for PortMatch {
    fn from(port: u16) -> Self {
        if port == PORT_SENTINEL {
            PortMatch::Any
        } else {
            PortMatch::Port(port)
        }
    }
}

impl FromStr for PortMatch {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_port(s).map(Self::from)
    }
}

fn parse_port(s: &str) -> ProxyResult<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|e| ProxyError::RewriteConfig(format!("invalid port {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_ipv4() {
        let addr = AddressSpec::parse("93.184.216.34:443").unwrap();
        assert_eq!(addr.ip, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(addr.port, 443);
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = AddressSpec::parse("[::1]:8080").unwrap();
        assert!(addr.ip.is_ipv6());
        assert_eq!(addr.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_parse_rejects_hostname() {
        let err = AddressSpec::parse("localhost:80").unwrap_err();
        assert!(matches!(err, ProxyError::RewriteConfig(_)));
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(AddressSpec::parse("10.0.0.5").is_err());
    }

    #[test]
    fn test_port_sentinels() {
        assert_eq!("0".parse::<PortTarget>().unwrap(), PortTarget::Preserve);
        assert_eq!("8443".parse::<PortTarget>().unwrap(), PortTarget::Port(8443));
        assert_eq!("0".parse::<PortMatch>().unwrap(), PortMatch::Any);
        assert_eq!("80".parse::<PortMatch>().unwrap(), PortMatch::Port(80));
    }

    #[test]
    fn test_port_parse_errors() {
        assert!("".parse::<PortTarget>().is_err());
        assert!("70000".parse::<PortMatch>().is_err());
        assert!("http".parse::<PortTarget>().is_err());
    }

    #[test]
    fn test_port_target_apply() {
        assert_eq!(PortTarget::Preserve.apply(22), 22);
        assert_eq!(PortTarget::Port(8080).apply(22), 8080);
    }
}
