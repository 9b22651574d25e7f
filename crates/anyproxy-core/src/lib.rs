//! anyproxy-core: the SOCKS5 "any-destination" redirector core.
//!
//! Clients ask the proxy for any destination; the proxy ignores it and
//! dials a fixed, reconfigurable target instead. This crate provides the
//! pieces that decide where a request really goes and the server that
//! owns every connection while it is in flight:
//!
//! - [`rewrite`]: address rewriting strategies and their ordered chain.
//! - [`resolver`]: a name resolver answering one configured address.
//! - [`tracker`] / [`conn`]: the registry of tracked connections.
//! - [`server`]: accept loop, graceful drain and hard close.
//! - [`socks5`]: the protocol engine that consumes the resolver and
//!   rewriter for each connection.

pub mod addr;
pub mod conn;
pub mod context;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod rewrite;
pub mod server;
pub mod socks5;
pub mod tracker;

pub use addr::{AddressSpec, PortMatch, PortTarget, Request, PORT_SENTINEL};
pub use conn::{ConnId, ConnState, TrackedConn};
pub use context::{Context, ContextError};
pub use engine::{ConnContext, EngineFuture, ProtocolEngine};
pub use error::{ProxyError, ProxyResult};
pub use resolver::{FixedResolver, NameResolver, SharedResolver, LOOPBACK_RESOLVER};
pub use rewrite::{
    chain, AddressRewriter, Chain, HostTranslate, NoRewrite, PortMap, Redirect, SharedRewriter,
    LOOPBACK_REDIRECT,
};
pub use server::{Server, ServerConfig};
pub use socks5::Socks5Engine;
pub use tracker::{ConnectionTracker, TrackerStats};
