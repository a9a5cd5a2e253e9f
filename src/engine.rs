//! The contract between this layer and the native HTTP engine.
//!
//! The engine owns sockets, TLS, HTTP parsing, and the event loop. This
//! crate only ever talks to it through the object-safe traits below:
//! [`Engine`] for route binding and socket lifecycle, [`RawRequest`] /
//! [`RawResponse`] for a single exchange. The raw request handle is volatile
//! and only valid for the duration of the route callback; request contexts
//! copy everything they need out of it synchronously.
//!
//! Outbound streaming is modeled as two capability traits,
//! [`ReadableSource`] and [`StreamSink`], instead of a stream class
//! hierarchy. A source pushes owned chunks into a sink; the sink signals
//! backpressure through its return value and the owner resumes the source
//! once the transport drains.

use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// Callback invoked by the engine for every exchange matching a bound route.
pub type ExchangeHandler = Box<dyn Fn(Rc<dyn RawResponse>, &dyn RawRequest)>;

/// Opaque handle for one listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenToken(pub u64);

/// Route binding and socket lifecycle of the native engine.
pub trait Engine {
    /// Receives the resolved server options (TLS material, buffer and
    /// shutdown policy) before any route is bound. Engines that source
    /// these elsewhere may ignore the call.
    fn configure(&mut self, config: &crate::config::ServerConfig) {
        let _ = config;
    }

    /// Binds `handler` to `method` + `pattern`. The engine performs the
    /// pattern matching; `pattern` uses `:name` and trailing-`*` syntax.
    fn register_route(&mut self, method: &str, pattern: &str, handler: ExchangeHandler);

    /// Opens a listening socket.
    fn listen(&mut self, host: &str, port: u16) -> io::Result<ListenToken>;

    /// Closes one listening socket, or all of them when `token` is `None`.
    /// Returns `false` when nothing was open.
    fn close(&mut self, token: Option<ListenToken>) -> bool;
}

/// Volatile view of the inbound request head; valid only inside the
/// exchange callback.
pub trait RawRequest {
    fn method(&self) -> &str;
    /// Path portion of the request target, without the query string.
    fn url(&self) -> &str;
    /// Raw query string, without the leading `?`.
    fn query(&self) -> &str;
    fn for_each_header(&self, f: &mut dyn FnMut(&str, &str));
    /// Positional path capture, indexed by parameter declaration order.
    fn parameter(&self, index: usize) -> Option<&str>;
}

/// Write side and lifecycle of one exchange.
///
/// Backpressure-aware contract: `try_end` returns
/// `(accepted, done)`, `write_offset` reports bytes the transport has taken
/// so far, and `on_writable` re-fires the given callback with the current
/// offset until it returns `true`.
pub trait RawResponse {
    /// Registers the abort observer. Mandatory before any asynchronous use.
    fn on_aborted(&self, cb: Box<dyn FnOnce()>);
    /// Registers the inbound body chunk observer; `true` marks the last chunk.
    fn on_data(&self, cb: Box<dyn FnMut(&[u8], bool)>);
    /// Registers a drain callback invoked with the current write offset.
    fn on_writable(&self, cb: Box<dyn FnMut(usize) -> bool>);

    fn write_status(&self, code: u16, reason: &str);
    fn write_header(&self, name: &str, value: &str);
    /// Chunked-mode body write; `false` signals backpressure.
    fn write(&self, chunk: &[u8]) -> bool;
    /// Sized-mode body write: `(accepted, done)`.
    fn try_end(&self, chunk: &[u8], total_size: usize) -> (bool, bool);
    /// Finishes the response; the engine frames the body length itself.
    fn end(&self, body: Option<&[u8]>, close_connection: bool) -> bool;
    /// Finishes a response that must not carry a body (HEAD).
    fn end_without_body(&self);

    /// Inbound flow control.
    fn pause(&self);
    fn resume(&self);
    /// Closes the underlying connection without a response.
    fn close(&self);
    /// Runs `f` inside the engine's atomic-write scope.
    fn cork(&self, f: Box<dyn FnOnce()>);
    /// Bytes of the current body the transport has accepted so far.
    fn write_offset(&self) -> usize;

    /// Peer address in engine binary form (4 bytes IPv4, 16 bytes IPv6).
    fn remote_address(&self) -> Vec<u8>;
    /// Address reported by a fronting proxy, same binary form.
    fn proxied_remote_address(&self) -> Vec<u8>;
}

/// Receiver side of outbound streaming.
pub trait StreamSink {
    /// Accepts one owned chunk. Returning `false` signals backpressure: the
    /// source must stop delivering until it is resumed; the sink keeps the
    /// chunk and is responsible for retrying its unaccepted remainder.
    fn push(&mut self, chunk: Vec<u8>) -> bool;
    /// The source is exhausted.
    fn end(&mut self);
}

/// Producer side of outbound streaming.
pub trait ReadableSource {
    /// Begins delivery into `sink`. Delivery may complete synchronously.
    fn start(&mut self, sink: Box<dyn StreamSink>);
    fn pause(&mut self);
    fn resume(&mut self);
    /// Tears the source down; no further delivery happens.
    fn destroy(&mut self);
    fn is_destroyed(&self) -> bool;
}

/// In-memory [`ReadableSource`] over a queue of owned chunks.
///
/// Used for static file delivery, multipart file fields, and tests.
pub struct BytesSource {
    chunks: VecDeque<Vec<u8>>,
    sink: Option<Box<dyn StreamSink>>,
    paused: bool,
    destroyed: bool,
    ended: bool,
}

impl BytesSource {
    #[must_use]
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            sink: None,
            paused: false,
            destroyed: false,
            ended: false,
        }
    }

    /// Single-chunk convenience constructor.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(vec![bytes])
    }

    fn drive(&mut self) {
        while !self.paused && !self.destroyed && !self.ended {
            let Some(sink) = self.sink.as_mut() else {
                return;
            };
            match self.chunks.pop_front() {
                Some(chunk) => {
                    if !sink.push(chunk) {
                        self.paused = true;
                        return;
                    }
                }
                None => {
                    self.ended = true;
                    sink.end();
                }
            }
        }
    }
}

impl ReadableSource for BytesSource {
    fn start(&mut self, sink: Box<dyn StreamSink>) {
        self.sink = Some(sink);
        self.drive();
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.drive();
        }
    }

    fn destroy(&mut self) {
        self.destroyed = true;
        self.sink = None;
        self.chunks.clear();
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}
