//! # Server Module
//!
//! Composes the router, dispatcher, and the external engine into the
//! application surface: verb registration, middleware mounting, error and
//! not-found handlers, listen/close.
//!
//! The server subscribes to its own root [`crate::router::Router`], so
//! records arrive the same way whether they were registered directly or
//! through a mounted child router. Every accepted route is immediately
//! bound to the engine; the engine calls back into the server's exchange
//! entry once per matching request.

mod core;

pub use core::Server;
