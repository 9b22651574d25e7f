//! Address rewriting: decides which upstream endpoint a request really uses.
//!
//! # Strategies
//!
//! | Strategy           | Effect                                              |
//! |--------------------|-----------------------------------------------------|
//! | [`Redirect`]       | Replace the host; replace or keep the port.         |
//! | [`PortMap`]        | Replace the port when it matches; host untouched.   |
//! | [`HostTranslate`]  | Replace the host; always keep the port.             |
//! | [`Chain`]          | Apply strategies in order, output feeding input.    |
//! | [`NoRewrite`]      | Identity.                                           |
//!
//! Every strategy checks its [`Context`] first. A cancelled context yields
//! the request's original destination, never a partial or empty result.

mod chain;
mod host_translate;
mod port_map;
mod redirect;

pub use chain::{chain, Chain};
pub use host_translate::HostTranslate;
pub use port_map::PortMap;
pub use redirect::{Redirect, LOOPBACK_REDIRECT};

use crate::addr::{AddressSpec, Request};
use crate::context::Context;
use std::fmt;
use std::sync::Arc;

/// Capability consumed by the protocol engine to pick the upstream target.
pub trait AddressRewriter: Send + Sync + fmt::Debug {
    /// Produce the destination to dial for `request`.
    fn rewrite(&self, ctx: &Context, request: &Request) -> AddressSpec;
}

/// Rewriter shared between the server and every connection task.
pub type SharedRewriter = Arc<dyn AddressRewriter>;

impl<T: AddressRewriter + ?Sized> AddressRewriter for Arc<T> {
    fn rewrite(&self, ctx: &Context, request: &Request) -> AddressSpec {
        (**self).rewrite(ctx, request)
    }
}

/// Leaves every destination as requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRewrite;

impl AddressRewriter for NoRewrite {
    fn rewrite(&self, _ctx: &Context, request: &Request) -> AddressSpec {
        request.dest
    }
}
