//! Dispatcher core module - hot path for chain execution.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::error::HandlerError;
use crate::request::Request;
use crate::response::Response;
use crate::router::Route;

/// Uniform return value of handlers and middlewares.
pub type HandlerResult = Result<Outcome, HandlerError>;

/// Terminal route handler.
pub type RouteHandlerFn = dyn Fn(Request, Response) -> HandlerResult;

/// Chain middleware; receives the continuation as its third argument.
pub type MiddlewareFn = dyn Fn(Request, Response, Next) -> HandlerResult;

/// Per-server error handler, invoked at most once per exchange.
pub type ErrorHandlerFn = dyn Fn(Request, Response, HandlerError);

/// How a handler or middleware finished.
///
/// `Completed` means the stage is done synchronously (for a middleware that
/// means: it either responded or already invoked [`Next`] itself).
/// `Deferred` hands the chain a settlement cell; the stage finishes when the
/// matching [`Completion`] resolves or rejects.
pub enum Outcome {
    Completed,
    Deferred(Deferred),
}

impl Outcome {
    /// Creates a linked deferred outcome and its settlement handle.
    #[must_use]
    pub fn deferred() -> (Self, Completion) {
        let cell = Rc::new(RefCell::new(DeferredCell {
            settled: None,
            waiter: None,
        }));
        (
            Self::Deferred(Deferred {
                cell: Rc::clone(&cell),
            }),
            Completion { cell },
        )
    }
}

struct DeferredCell {
    settled: Option<Result<(), HandlerError>>,
    waiter: Option<Box<dyn FnOnce(Result<(), HandlerError>)>>,
}

/// Consumer half of a deferred outcome; owned by the chain.
pub struct Deferred {
    cell: Rc<RefCell<DeferredCell>>,
}

impl Deferred {
    /// Runs `f` when the deferred settles; immediately if it already has.
    pub fn on_settled(self, f: impl FnOnce(Result<(), HandlerError>) + 'static) {
        let already = {
            let mut cell = self.cell.borrow_mut();
            match cell.settled.clone() {
                Some(result) => Some(result),
                None => {
                    cell.waiter = Some(Box::new(f));
                    return;
                }
            }
        };
        if let Some(result) = already {
            f(result);
        }
    }
}

/// Producer half of a deferred outcome. Settlement consumes the handle, so
/// a deferred can settle exactly once.
pub struct Completion {
    cell: Rc<RefCell<DeferredCell>>,
}

impl Completion {
    pub fn resolve(self) {
        Self::settle(&self.cell, Ok(()));
    }

    pub fn reject(self, error: HandlerError) {
        Self::settle(&self.cell, Err(error));
    }

    fn settle(cell: &Rc<RefCell<DeferredCell>>, result: Result<(), HandlerError>) {
        let waiter = {
            let mut cell = cell.borrow_mut();
            cell.settled = Some(result.clone());
            cell.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter(result);
        }
    }
}

struct ChainCtx {
    route: Rc<Route>,
    globals: Rc<Vec<Rc<MiddlewareFn>>>,
    request: Request,
    response: Response,
}

/// Continuation handle passed to middlewares.
///
/// `ok()` advances to the next stage, `err(..)` short-circuits into the
/// error handler. Both are silent no-ops once the exchange has aborted.
#[derive(Clone)]
pub struct Next {
    ctx: Rc<ChainCtx>,
    cursor: usize,
}

impl Next {
    pub fn ok(&self) {
        advance(&self.ctx, self.cursor, None);
    }

    pub fn err(&self, error: HandlerError) {
        advance(&self.ctx, self.cursor, Some(error));
    }
}

/// Starts the chain for one exchange.
pub fn run_chain(
    route: Rc<Route>,
    globals: Rc<Vec<Rc<MiddlewareFn>>>,
    request: Request,
    response: Response,
) {
    let ctx = Rc::new(ChainCtx {
        route,
        globals,
        request,
        response,
    });
    advance(&ctx, 0, None);
}

fn advance(ctx: &Rc<ChainCtx>, cursor: usize, error: Option<HandlerError>) {
    if ctx.response.is_aborted() {
        debug!(
            request_id = %ctx.request.id(),
            cursor,
            "chain advance after abort, dropping"
        );
        return;
    }
    if let Some(error) = error {
        ctx.response.throw(error);
        return;
    }
    // The cursor may only ever move forward. A repeat or regression means a
    // middleware invoked its continuation and also settled asynchronously.
    if let Err(violation) = ctx.response.track_cursor(cursor) {
        ctx.response.throw(violation.into());
        return;
    }

    let globals_len = ctx.globals.len();
    let middleware = if cursor < globals_len {
        Some(Rc::clone(&ctx.globals[cursor]))
    } else {
        ctx.route.middleware_at(cursor - globals_len)
    };

    match middleware {
        Some(middleware) => {
            let next = Next {
                ctx: Rc::clone(ctx),
                cursor: cursor + 1,
            };
            let continuation = next.clone();
            match middleware(ctx.request.clone(), ctx.response.clone(), next) {
                Ok(Outcome::Completed) => {}
                Ok(Outcome::Deferred(deferred)) => {
                    deferred.on_settled(move |result| match result {
                        Ok(()) => continuation.ok(),
                        Err(error) => continuation.err(error),
                    });
                }
                Err(error) => continuation.err(error),
            }
        }
        None => {
            let handler = ctx.route.handler();
            let response = ctx.response.clone();
            match handler(ctx.request.clone(), ctx.response.clone()) {
                Ok(Outcome::Completed) => {}
                Ok(Outcome::Deferred(deferred)) => {
                    deferred.on_settled(move |result| {
                        if let Err(error) = result {
                            if !response.is_aborted() {
                                response.throw(error);
                            }
                        }
                    });
                }
                Err(error) => response.throw(error),
            }
        }
    }
}
