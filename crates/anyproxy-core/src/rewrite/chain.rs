use super::{AddressRewriter, NoRewrite, SharedRewriter};
use crate::addr::{AddressSpec, Request};
use crate::context::Context;
use std::sync::Arc;

/// Applies rewriters in order, each seeing the previous one's output.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    stages: Vec<SharedRewriter>,
}

impl Chain {
    pub fn new(stages: Vec<SharedRewriter>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl AddressRewriter for Chain {
    fn rewrite(&self, ctx: &Context, request: &Request) -> AddressSpec {
        let mut req = request.clone();
        for stage in &self.stages {
            if ctx.is_done() {
                return request.dest;
            }
            req.dest = stage.rewrite(ctx, &req);
        }

        // a stage may have observed the cancellation
        if ctx.is_done() {
            return request.dest;
        }
        req.dest
    }
}

/// Compose `stages` into one rewriter. Zero stages is the identity and a
/// single stage is returned as is.
pub fn chain(mut stages: Vec<SharedRewriter>) -> SharedRewriter {
    match stages.len() {
        0 => Arc::new(NoRewrite),
        1 => stages.remove(0),
        _ => Arc::new(Chain::new(stages)),
    }
}
