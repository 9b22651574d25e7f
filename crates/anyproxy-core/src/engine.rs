//! The seam between the server and the protocol spoken on each connection.

use crate::addr::{AddressSpec, Request};
use crate::conn::{ConnId, ConnState, TrackedConn};
use crate::context::{Context, ContextError};
use crate::error::ProxyResult;
use crate::resolver::SharedResolver;
use crate::rewrite::SharedRewriter;
use crate::tracker::ConnectionTracker;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Weak;
use tokio::net::TcpStream;

pub type EngineFuture<'a> = Pin<Box<dyn Future<Output = ProxyResult<()>> + Send + 'a>>;

/// Serves one accepted connection to completion.
///
/// Implementations must consult [`ConnContext::resolve`] and
/// [`ConnContext::rewrite`] while negotiating the request, and drop the
/// connection when the session ends; dropping it is what deregisters it.
pub trait ProtocolEngine: Send + Sync {
    fn serve_conn<'a>(&'a self, ctx: ConnContext, conn: TrackedConn<TcpStream>) -> EngineFuture<'a>;
}

/// Per-connection capabilities handed to the engine.
#[derive(Debug, Clone)]
pub struct ConnContext {
    id: ConnId,
    peer: SocketAddr,
    ctx: Context,
    resolver: SharedResolver,
    rewriter: SharedRewriter,
    tracker: Weak<ConnectionTracker>,
}

impl ConnContext {
    pub(crate) fn new(
        id: ConnId,
        peer: SocketAddr,
        ctx: Context,
        resolver: SharedResolver,
        rewriter: SharedRewriter,
        tracker: Weak<ConnectionTracker>,
    ) -> Self {
        Self {
            id,
            peer,
            ctx,
            resolver,
            rewriter,
            tracker,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cancelled when the server force-closes this connection.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn resolve(&self, name: &str) -> Result<IpAddr, ContextError> {
        self.resolver.resolve(&self.ctx, name)
    }

    pub fn rewrite(&self, request: &Request) -> AddressSpec {
        self.rewriter.rewrite(&self.ctx, request)
    }

    /// State of this connection as seen by the owning server, `None` once
    /// it is no longer tracked.
    pub fn connection_state(&self) -> Option<ConnState> {
        self.tracker.upgrade()?.state_of(self.id)
    }
}
