use super::AddressRewriter;
use crate::addr::{AddressSpec, PortTarget, Request};
use crate::context::Context;
use crate::error::ProxyResult;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Pre-built redirect of every request to loopback, keeping the port.
pub const LOOPBACK_REDIRECT: Redirect = Redirect::new(IpAddr::V4(Ipv4Addr::LOCALHOST), PortTarget::Preserve);

/// Sends every request to a fixed host. The port is either fixed too or
/// kept from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    host: IpAddr,
    port: PortTarget,
}

impl Redirect {
    pub const fn new(host: IpAddr, port: PortTarget) -> Self {
        Self { host, port }
    }

    /// Parse `ip:port`; port `0` keeps the client's port.
    pub fn parse(addr: &str) -> ProxyResult<Self> {
        let spec = AddressSpec::parse(addr)?;
        Ok(Self::new(spec.ip, PortTarget::from(spec.port)))
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> PortTarget {
        self.port
    }
}

impl AddressRewriter for Redirect {
    fn rewrite(&self, ctx: &Context, request: &Request) -> AddressSpec {
        if ctx.is_done() {
            return request.dest;
        }

        let ret = AddressSpec::new(self.host, self.port.apply(request.dest.port));
        debug!(component = "rewriter", request = %request.dest, address = %ret, "translated");
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn test_preserve_keeps_requested_port() {
        let r = Redirect::parse("10.0.0.5:0").unwrap();
        let out = r.rewrite(&Context::background(), &request("93.184.216.34:443"));
        assert_eq!(out.to_string(), "10.0.0.5:443");
    }

    #[test]
    fn test_fixed_port_overrides() {
        let r = Redirect::parse("10.0.0.5:9000").unwrap();
        for requested in ["1.1.1.1:80", "8.8.8.8:443", "9.9.9.9:9000"] {
            let out = r.rewrite(&Context::background(), &request(requested));
            assert_eq!(out.to_string(), "10.0.0.5:9000");
        }
    }

    #[test]
    fn test_cancelled_returns_original() {
        let r = Redirect::parse("10.0.0.5:9000").unwrap();
        let req = request("93.184.216.34:443");
        assert_eq!(r.rewrite(&cancelled(), &req), req.dest);
    }

    #[test]
    fn test_loopback_default() {
        let out = LOOPBACK_REDIRECT.rewrite(&Context::background(), &request("8.8.8.8:53"));
        assert_eq!(out.to_string(), "127.0.0.1:53");
    }

    #[test]
    fn test_parse_rejects_hostname() {
        assert!(Redirect::parse("example.com:80").is_err());
    }
}
