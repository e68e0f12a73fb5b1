//! The per-request filter chain.
//!
//! Filters receive the context together with the remainder of the chain
//! ([`Next`]) and choose between three behaviours:
//!
//! - transparent: call [`Next::do_chain`] and return;
//! - short-circuit: write a response into the context and return without
//!   calling the rest of the chain;
//! - wrapping: call [`Next::do_chain`], then inspect or rewrite the
//!   response the tail produced.
//!
//! The chain advances by slice splitting rather than recursion into an
//! unbounded future type; each hop goes through one boxed trait object
//! call, which bounds stack depth by the chain length.

use std::{cell::Cell, rc::Rc};

use async_trait::async_trait;

use crate::context::Context;

#[async_trait(?Send)]
pub trait HttpFilter {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>);
}

/// Remainder of a filter chain.
pub struct Next<'a> {
    filters: &'a [Rc<dyn HttpFilter>],
    completed: &'a Cell<bool>,
}

impl Next<'_> {
    pub async fn do_chain(self, ctx: &mut Context) {
        match self.filters.split_first() {
            Some((head, rest)) => {
                head.do_filter(
                    ctx,
                    Next {
                        filters: rest,
                        completed: self.completed,
                    },
                )
                .await;
            }
            None => self.completed.set(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Every filter passed the request through; the caller proceeds to the
    /// upstream send.
    Completed,
    /// Some filter returned without invoking the rest of the chain; the
    /// context already carries the response.
    Responded,
}

/// Ordered filter sequence of a service. Order is preserved from the
/// configuration and duplicates are permitted.
#[derive(Default, Clone)]
pub struct FilterChain {
    filters: Vec<Rc<dyn HttpFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Rc<dyn HttpFilter>>) -> Self {
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn run(&self, ctx: &mut Context) -> ChainState {
        let completed = Cell::new(false);
        Next {
            filters: &self.filters,
            completed: &completed,
        }
        .do_chain(ctx)
        .await;
        if completed.get() {
            ChainState::Completed
        } else {
            ChainState::Responded
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, StatusCode};

    use super::*;

    struct Tag(&'static str);

    #[async_trait(?Send)]
    impl HttpFilter for Tag {
        async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
            let seen = ctx
                .metadata("tags")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            ctx.set_metadata("tags", format!("{seen}{}", self.0));
            next.do_chain(ctx).await;
        }
    }

    struct Reject;

    #[async_trait(?Send)]
    impl HttpFilter for Reject {
        async fn do_filter(&self, ctx: &mut Context, _next: Next<'_>) {
            ctx.set_error_response(StatusCode::UNAUTHORIZED, "rejected");
        }
    }

    fn ctx() -> Context {
        let req = Request::builder()
            .uri("/x")
            .body(Bytes::new())
            .unwrap();
        Context::new(req, 80, None)
    }

    #[test]
    fn empty_chain_completes() {
        let mut ctx = ctx();
        let chain = FilterChain::default();
        let state = futures::executor::block_on(chain.run(&mut ctx));
        assert_eq!(state, ChainState::Completed);
    }

    #[test]
    fn chain_preserves_order_and_duplicates() {
        let mut ctx = ctx();
        let a: Rc<dyn HttpFilter> = Rc::new(Tag("a"));
        let b: Rc<dyn HttpFilter> = Rc::new(Tag("b"));
        let chain = FilterChain::new(vec![a.clone(), b, a]);
        let state = futures::executor::block_on(chain.run(&mut ctx));
        assert_eq!(state, ChainState::Completed);
        assert_eq!(ctx.metadata("tags").unwrap(), "aba");
    }

    #[test]
    fn short_circuit_skips_tail() {
        let mut ctx = ctx();
        let chain = FilterChain::new(vec![
            Rc::new(Tag("a")) as Rc<dyn HttpFilter>,
            Rc::new(Reject),
            Rc::new(Tag("z")),
        ]);
        let state = futures::executor::block_on(chain.run(&mut ctx));
        assert_eq!(state, ChainState::Responded);
        assert_eq!(ctx.metadata("tags").unwrap(), "a");
        assert_eq!(
            ctx.response().unwrap().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
