//! # Dispatcher Module
//!
//! Executes the middleware chain for one exchange.
//!
//! ## Overview
//!
//! Every matched exchange runs through a single chain-advance state machine:
//! global middlewares first, then the route's combined (prefix + route)
//! middlewares, then the route handler. The machine:
//! - treats synchronous completion, synchronous errors, and deferred
//!   settlement uniformly through [`Outcome`],
//! - guards cursor monotonicity so a middleware that both invokes its
//!   continuation and settles asynchronously is detected instead of
//!   re-running downstream stages,
//! - silently stops once the client has aborted,
//! - routes every error to the exchange's error handler at most once.
//!
//! ## Handler Contract
//!
//! Handlers and middlewares are plain non-`Send` closures returning
//! [`HandlerResult`]:
//!
//! ```rust,ignore
//! server.get("/greet/:name", |req, res| {
//!     res.header("x-served-by", "expresslane")?;
//!     res.send(Some(b"hello"));
//!     Ok(Outcome::Completed)
//! })?;
//! ```
//!
//! A middleware defers by returning `Outcome::deferred()` and settling the
//! [`Completion`] half later from a callback; the chain resumes (or fails)
//! when it settles.

mod core;

pub use core::{
    run_chain, Completion, Deferred, ErrorHandlerFn, HandlerResult, MiddlewareFn, Next, Outcome,
    RouteHandlerFn,
};
