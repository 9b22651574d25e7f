//! Name resolution that never touches DNS.
//!
//! [`FixedResolver`] answers every query with one configured address, so a
//! client asking for any host name is pointed at the redirect target.

use crate::context::{Context, ContextError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

/// Capability consumed by the protocol engine for domain-name requests.
pub trait NameResolver: Send + Sync + fmt::Debug {
    /// Map `name` to an address. Fails only when `ctx` is done.
    fn resolve(&self, ctx: &Context, name: &str) -> Result<IpAddr, ContextError>;
}

/// Resolver shared between the server and every connection task.
pub type SharedResolver = Arc<dyn NameResolver>;

/// Pre-built resolver answering `127.0.0.1` for every name.
pub const LOOPBACK_RESOLVER: FixedResolver = FixedResolver::new(IpAddr::V4(Ipv4Addr::LOCALHOST));

/// Answers every name with the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedResolver {
    answer: IpAddr,
}

impl FixedResolver {
    pub const fn new(answer: IpAddr) -> Self {
        Self { answer }
    }

    pub fn answer(&self) -> IpAddr {
        self.answer
    }
}

impl NameResolver for FixedResolver {
    fn resolve(&self, ctx: &Context, name: &str) -> Result<IpAddr, ContextError> {
        if let Some(e) = ctx.err() {
            return Err(e);
        }

        debug!(component = "resolver", query = name, response = %self.answer, "resolved");
        Ok(self.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignores_queried_name() {
        let r = FixedResolver::new("10.0.0.5".parse().unwrap());
        let ctx = Context::background();
        for name in ["example.com", "localhost", "", "a.b.c.d.e"] {
            assert_eq!(r.resolve(&ctx, name).unwrap(), r.answer());
        }
    }

    #[test]
    fn test_cancelled_context_is_error() {
        let ctx = Context::background();
        ctx.cancel();
        assert_eq!(
            LOOPBACK_RESOLVER.resolve(&ctx, "example.com"),
            Err(ContextError::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_context_is_error() {
        let ctx = Context::background().with_timeout(std::time::Duration::from_millis(5));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(
            LOOPBACK_RESOLVER.resolve(&ctx, "example.com"),
            Err(ContextError::DeadlineExceeded)
        );
    }

    #[test]
    fn test_loopback_resolver() {
        let ip = LOOPBACK_RESOLVER.resolve(&Context::background(), "anything").unwrap();
        assert!(ip.is_loopback());
    }
}
