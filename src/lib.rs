//! # expresslane
//!
//! **expresslane** is a thin, Express-style application layer for Rust over a
//! pluggable native HTTP engine. The engine owns sockets, TLS, HTTP parsing,
//! and the event loop; this crate owns everything an application framework
//! adds on top: routing, middleware chaining, request/response contexts,
//! body decoding, streaming with backpressure, and static file serving.
//!
//! ## Architecture
//!
//! - **[`engine`]** - the narrow trait contract to the native engine, plus
//!   the streaming capability traits
//! - **[`pattern`]** - route pattern parsing (`:name` parameters, trailing
//!   `*` wildcard) and mount-prefix merging
//! - **[`router`]** - registration records with publish/subscribe mounting
//! - **[`dispatcher`]** - the middleware chain state machine
//! - **[`request`]** / **[`response`]** - per-exchange contexts
//! - **[`server`]** - composition root: verb surface, body-size policy,
//!   listen/close
//! - **[`multipart`]** - `multipart/form-data` decoding with sequential
//!   field delivery
//! - **[`static_files`]** - static serving middleware with an opt-in
//!   process-wide cache pool
//! - **[`cookies`]**, **[`mime`]**, **[`ids`]**, **[`config`]**,
//!   **[`logging`]** - supporting utilities
//!
//! ## Example
//!
//! ```rust,ignore
//! use expresslane::{Outcome, Server, ServerConfig};
//!
//! let server = Server::new(engine, ServerConfig::default());
//! server.use_middleware("/", |_req, res, next| {
//!     res.header("x-powered-by", "expresslane")?;
//!     next.ok();
//!     Ok(Outcome::Completed)
//! })?;
//! server.get("/users/:userid", |req, res| {
//!     let id = req.param("userid").unwrap_or_default();
//!     res.json(&serde_json::json!({ "id": id }))?;
//!     Ok(Outcome::Completed)
//! })?;
//! server.listen("0.0.0.0", 8080)?;
//! ```
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative, mirroring the engine's event loop:
//! contexts are `Rc`-based and handlers are non-`Send` closures. The only
//! cross-thread state is the static file cache pool.

pub mod config;
pub mod cookies;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ids;
pub mod logging;
pub mod mime;
pub mod multipart;
pub mod pattern;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod static_files;

pub use config::{ServerConfig, ServerConfigError};
pub use dispatcher::{Completion, HandlerResult, Next, Outcome};
pub use engine::{BytesSource, Engine, ListenToken, RawRequest, RawResponse};
pub use error::{ConfigError, HandlerError, MultipartError, ProtocolViolation};
pub use ids::RequestId;
pub use multipart::{MultipartField, MultipartLimits};
pub use request::Request;
pub use response::Response;
pub use router::{RouteOptions, Router};
pub use server::Server;
pub use static_files::StaticFiles;
