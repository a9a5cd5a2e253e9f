//! # Router Module
//!
//! Route and middleware registration with publish/subscribe mounting.
//!
//! ## Overview
//!
//! A [`Router`] is a recorder: it accumulates route and middleware drafts
//! and republishes them to subscribers. Mounting a child router under a
//! prefix subscribes the parent to the child - past records are replayed
//! first, then future ones stream through - so registration order and mount
//! order are independent. The server is just the final subscriber; its
//! rejection (duplicate route, locked table) propagates synchronously back
//! to the registration call site.
//!
//! ## Middleware priorities
//!
//! Middlewares combine per route in three priority classes:
//! - `0` - global (`use_middleware("/", ..)`), consulted for every route,
//! - `1` - prefix-mounted (`use_middleware("/api", ..)`), injected into
//!   every route whose pattern falls under the prefix, including routes
//!   created before the middleware,
//! - `2` - route-specific ([`RouteOptions::middleware`]).
//!
//! Ties within a class keep registration order.

mod core;
mod route;

pub use core::{MiddlewareDraft, RouteDraft, RouteMethod, RouteOptions, Router, RouterEvent};
pub use route::Route;
