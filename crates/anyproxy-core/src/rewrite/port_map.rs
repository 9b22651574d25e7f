use super::AddressRewriter;
use crate::addr::{AddressSpec, PortMatch, PortTarget, Request};
use crate::context::Context;
use crate::error::ProxyResult;
use tracing::debug;

/// Maps one requested port (or any port) to another, leaving the host alone.
///
/// A [`PortTarget::Preserve`] target disables the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    from: PortMatch,
    to: PortTarget,
}

impl PortMap {
    pub const fn new(from: PortMatch, to: PortTarget) -> Self {
        Self { from, to }
    }

    /// Parse the textual form used on the command line; `"0"` is the
    /// wildcard for `from` and "preserve" for `to`.
    pub fn parse(from: &str, to: &str) -> ProxyResult<Self> {
        Ok(Self::new(from.parse()?, to.parse()?))
    }

    pub fn is_noop(&self) -> bool {
        self.to == PortTarget::Preserve
    }
}

impl AddressRewriter for PortMap {
    fn rewrite(&self, ctx: &Context, request: &Request) -> AddressSpec {
        if ctx.is_done() || !self.from.matches(request.dest.port) {
            return request.dest;
        }

        let ret = request.dest.with_port(self.to.apply(request.dest.port));
        debug!(component = "port-map", request = %request.dest, address = %ret, "translated");
        ret
    }
}
