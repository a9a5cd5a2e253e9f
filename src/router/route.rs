//! Server-side route record.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispatcher::{MiddlewareFn, RouteHandlerFn};
use crate::pattern::RoutePattern;
use crate::request::Request;
use crate::response::Response;
use crate::router::core::RouteMethod;

pub(crate) struct MiddlewareEntry {
    pub priority: u8,
    pub seq: usize,
    pub func: Rc<MiddlewareFn>,
}

/// One bound route: immutable identity plus an appendable combined
/// middleware list.
///
/// The list is appendable because prefix-mounted middlewares registered
/// *after* the route must still apply to it; entries stay ordered by
/// `(priority, registration sequence)`.
pub struct Route {
    method: RouteMethod,
    pattern: RoutePattern,
    handler: Rc<RouteHandlerFn>,
    max_body_length: Option<usize>,
    decorate_request: Option<Rc<dyn Fn(&Request)>>,
    decorate_response: Option<Rc<dyn Fn(&Response)>>,
    middlewares: RefCell<Vec<MiddlewareEntry>>,
}

impl Route {
    pub(crate) fn new(
        method: RouteMethod,
        pattern: RoutePattern,
        handler: Rc<RouteHandlerFn>,
        max_body_length: Option<usize>,
        decorate_request: Option<Rc<dyn Fn(&Request)>>,
        decorate_response: Option<Rc<dyn Fn(&Response)>>,
    ) -> Self {
        Self {
            method,
            pattern,
            handler,
            max_body_length,
            decorate_request,
            decorate_response,
            middlewares: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn push_middleware(&self, priority: u8, seq: usize, func: Rc<MiddlewareFn>) {
        let mut middlewares = self.middlewares.borrow_mut();
        middlewares.push(MiddlewareEntry {
            priority,
            seq,
            func,
        });
        // Stable by construction: sort_by_key keeps equal keys in push order.
        middlewares.sort_by_key(|entry| (entry.priority, entry.seq));
    }

    pub(crate) fn middleware_at(&self, index: usize) -> Option<Rc<MiddlewareFn>> {
        self.middlewares
            .borrow()
            .get(index)
            .map(|entry| Rc::clone(&entry.func))
    }

    #[must_use]
    pub fn method(&self) -> &RouteMethod {
        &self.method
    }

    #[must_use]
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub(crate) fn handler(&self) -> Rc<RouteHandlerFn> {
        Rc::clone(&self.handler)
    }

    pub(crate) fn max_body_length(&self) -> Option<usize> {
        self.max_body_length
    }

    pub(crate) fn decorate(&self, request: &Request, response: &Response) {
        if let Some(f) = &self.decorate_request {
            f(request);
        }
        if let Some(f) = &self.decorate_response {
            f(response);
        }
    }
}
