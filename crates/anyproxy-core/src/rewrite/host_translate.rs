use super::AddressRewriter;
use crate::addr::{AddressSpec, Request};
use crate::context::Context;
use crate::error::{ProxyError, ProxyResult};
use std::net::IpAddr;
use tracing::debug;

/// Replaces the host and keeps the requested port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTranslate {
    host: IpAddr,
}

impl HostTranslate {
    pub const fn new(host: IpAddr) -> Self {
        Self { host }
    }

    pub fn parse(host: &str) -> ProxyResult<Self> {
        host.parse()
            .map(Self::new)
            .map_err(|e| ProxyError::RewriteConfig(format!("invalid host {host:?}: {e}")))
    }
}

impl AddressRewriter for HostTranslate {
    fn rewrite(&self, ctx: &Context, request: &Request) -> AddressSpec {
        if ctx.is_done() {
            return request.dest;
        }

        let ret = request.dest.with_ip(self.host);
        debug!(component = "host-translate", request = %request.dest, address = %ret, "translated");
        ret
    }
}
