//! Response context.
//!
//! Status, headers, and cookies accumulate locally until the first body
//! operation commits them to the transport inside a cork (atomic write)
//! scope. After commit, head mutation is a hard protocol error; after
//! completion, write operations degrade to silent no-ops returning `false`.
//! Aborts flip both flags and fire the registered lifecycle hooks.
//!
//! Outbound streaming feeds a [`ReadableSource`] through a sink bridge.
//! When a total size is known the sized `try_end` primitive is used so the
//! engine can frame `Content-Length`; otherwise chunked `write` plus an
//! explicit end. On transport backpressure the bridge refuses the chunk
//! (pausing the source), registers a one-shot drain retry for the unaccepted
//! remainder, and resumes the source once the retry lands.

use std::cell::RefCell;
use std::rc::Rc;

use http::StatusCode;
use serde_json::Value;
use tracing::{debug, error};

use crate::dispatcher::ErrorHandlerFn;
use crate::engine::{RawResponse, ReadableSource, StreamSink};
use crate::error::{HandlerError, ProtocolViolation};
use crate::request::Request;

struct ResponseInner {
    raw: Rc<dyn RawResponse>,
    request: Request,
    on_error: Rc<ErrorHandlerFn>,
    status: u16,
    headers: Vec<(String, Vec<String>)>,
    initiated: bool,
    completed: bool,
    streaming: bool,
    aborted: bool,
    cursor: Option<usize>,
    error_handled: bool,
    prepare_hooks: Vec<Box<dyn FnOnce(&Response)>>,
    finish_hooks: Vec<Box<dyn FnOnce()>>,
    abort_hooks: Vec<Box<dyn FnOnce()>>,
    close_hooks: Vec<Box<dyn FnOnce()>>,
}

/// Cheap-clone handle to one exchange's response state.
#[derive(Clone)]
pub struct Response {
    inner: Rc<RefCell<ResponseInner>>,
}

impl Response {
    pub(crate) fn new(
        request: Request,
        raw: Rc<dyn RawResponse>,
        on_error: Rc<ErrorHandlerFn>,
    ) -> Self {
        let response = Self {
            inner: Rc::new(RefCell::new(ResponseInner {
                raw: Rc::clone(&raw),
                request,
                on_error,
                status: 200,
                headers: Vec::new(),
                initiated: false,
                completed: false,
                streaming: false,
                aborted: false,
                cursor: None,
                error_handled: false,
                prepare_hooks: Vec::new(),
                finish_hooks: Vec::new(),
                abort_hooks: Vec::new(),
                close_hooks: Vec::new(),
            })),
        };
        let observer = response.clone();
        raw.on_aborted(Box::new(move || observer.handle_abort()));
        response
    }

    // ---- state probes ----

    #[must_use]
    pub fn is_initiated(&self) -> bool {
        self.inner.borrow().initiated
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.borrow().completed
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.inner.borrow().streaming
    }

    /// The request this response answers.
    #[must_use]
    pub fn request(&self) -> Request {
        self.inner.borrow().request.clone()
    }

    pub(crate) fn raw(&self) -> Rc<dyn RawResponse> {
        Rc::clone(&self.inner.borrow().raw)
    }

    /// Chain-position witness. The cursor must strictly increase; a repeat
    /// or regression means a middleware ran its continuation twice.
    pub(crate) fn track_cursor(&self, cursor: usize) -> Result<(), ProtocolViolation> {
        let mut inner = self.inner.borrow_mut();
        if let Some(last) = inner.cursor {
            if cursor <= last {
                return Err(ProtocolViolation::DoubleDispatch { cursor });
            }
        }
        inner.cursor = Some(cursor);
        Ok(())
    }

    // ---- head mutation (pre-commit only) ----

    pub fn status(&self, code: u16) -> Result<(), HandlerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.initiated {
            return Err(ProtocolViolation::HeadersCommitted { op: "status" }.into());
        }
        inner.status = code;
        Ok(())
    }

    /// Appends a header value; repeated names send multiple lines in
    /// insertion order.
    pub fn header(&self, name: &str, value: &str) -> Result<(), HandlerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.initiated {
            return Err(ProtocolViolation::HeadersCommitted { op: "header" }.into());
        }
        match inner
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, values)) => values.push(value.to_string()),
            None => inner.headers.push((name.to_string(), vec![value.to_string()])),
        }
        Ok(())
    }

    /// Sets (replaces) the content type.
    pub fn content_type(&self, value: &str) -> Result<(), HandlerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.initiated {
            return Err(ProtocolViolation::HeadersCommitted { op: "content_type" }.into());
        }
        match inner
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-type"))
        {
            Some((_, values)) => *values = vec![value.to_string()],
            None => inner
                .headers
                .push(("content-type".to_string(), vec![value.to_string()])),
        }
        Ok(())
    }

    /// Queues a `Set-Cookie` header.
    pub fn cookie(
        &self,
        name: &str,
        value: &str,
        options: &crate::cookies::CookieOptions,
    ) -> Result<(), HandlerError> {
        let line = crate::cookies::serialize(name, value, options);
        self.header("set-cookie", &line)
    }

    /// Queues a signed `Set-Cookie` header.
    pub fn cookie_signed(
        &self,
        name: &str,
        value: &str,
        secret: &str,
        options: &crate::cookies::CookieOptions,
    ) -> Result<(), HandlerError> {
        let signed = crate::cookies::sign(value, secret);
        self.cookie(name, &signed, options)
    }

    /// Expires a cookie on the client.
    pub fn clear_cookie(&self, name: &str) -> Result<(), HandlerError> {
        let options = crate::cookies::CookieOptions {
            max_age: Some(0),
            ..crate::cookies::CookieOptions::default()
        };
        self.cookie(name, "", &options)
    }

    // ---- lifecycle hooks ----

    /// Runs just before the head is committed; last chance to mutate it.
    pub fn on_prepare(&self, f: impl FnOnce(&Response) + 'static) {
        self.inner.borrow_mut().prepare_hooks.push(Box::new(f));
    }

    /// Runs when a non-streamed body has been handed to the transport.
    pub fn on_finish(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().finish_hooks.push(Box::new(f));
    }

    /// Runs when the client aborts; immediately if it already has.
    pub fn on_abort(&self, f: impl FnOnce() + 'static) {
        let already = self.inner.borrow().aborted;
        if already {
            f();
        } else {
            self.inner.borrow_mut().abort_hooks.push(Box::new(f));
        }
    }

    /// Runs when the exchange completes for any reason.
    pub fn on_close(&self, f: impl FnOnce() + 'static) {
        let already = self.inner.borrow().completed;
        if already {
            f();
        } else {
            self.inner.borrow_mut().close_hooks.push(Box::new(f));
        }
    }

    // ---- commit & body ----

    /// Commits status and headers inside the engine's cork scope.
    fn commit(&self) {
        {
            let inner = self.inner.borrow();
            if inner.initiated || inner.aborted {
                return;
            }
        }
        let hooks = std::mem::take(&mut self.inner.borrow_mut().prepare_hooks);
        for hook in hooks {
            hook(self);
        }

        let (raw, status, headers) = {
            let mut inner = self.inner.borrow_mut();
            if inner.initiated || inner.aborted {
                return;
            }
            inner.initiated = true;
            (
                Rc::clone(&inner.raw),
                inner.status,
                inner.headers.clone(),
            )
        };
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        let writer = Rc::clone(&raw);
        raw.cork(Box::new(move || {
            writer.write_status(status, reason);
            for (name, values) in &headers {
                for value in values {
                    writer.write_header(name, value);
                }
            }
        }));
    }

    /// Sends the body and finishes the response. Returns `false` (silently)
    /// once the response is already completed.
    pub fn send(&self, body: Option<&[u8]>) -> bool {
        self.send_with(body, false)
    }

    /// `send` with control over connection teardown.
    pub fn send_with(&self, body: Option<&[u8]>, close_connection: bool) -> bool {
        if self.inner.borrow().completed {
            return false;
        }
        self.commit();

        let (raw, request, streaming, is_head) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.raw),
                inner.request.clone(),
                inner.streaming,
                inner.request.method() == http::Method::HEAD,
            )
        };
        request.stop_streaming();

        // HEAD responses carry no body frame at all; every other bodiless
        // send ends with an explicit empty body so the engine emits
        // Content-Length: 0.
        let sent = if is_head && !streaming {
            raw.end_without_body();
            true
        } else {
            raw.end(body, close_connection)
        };

        let (finish_hooks, close_hooks) = {
            let mut inner = self.inner.borrow_mut();
            let finish_hooks = if inner.streaming {
                Vec::new()
            } else {
                std::mem::take(&mut inner.finish_hooks)
            };
            let close_hooks = if sent && !inner.completed {
                inner.completed = true;
                std::mem::take(&mut inner.close_hooks)
            } else {
                Vec::new()
            };
            (finish_hooks, close_hooks)
        };
        for hook in finish_hooks {
            hook();
        }
        for hook in close_hooks {
            hook();
        }
        sent
    }

    /// Serializes and sends a JSON body.
    pub fn json(&self, value: &Value) -> Result<bool, HandlerError> {
        self.content_type("application/json")?;
        let body = serde_json::to_vec(value)?;
        Ok(self.send(Some(&body)))
    }

    /// Sends an HTML body.
    pub fn html(&self, body: &str) -> Result<bool, HandlerError> {
        self.content_type("text/html")?;
        Ok(self.send(Some(body.as_bytes())))
    }

    /// 302 redirect.
    pub fn redirect(&self, location: &str) -> Result<bool, HandlerError> {
        self.redirect_with_status(302, location)
    }

    pub fn redirect_with_status(&self, code: u16, location: &str) -> Result<bool, HandlerError> {
        self.status(code)?;
        self.header("location", location)?;
        Ok(self.send(None))
    }

    /// Manual chunked body write. Commits the head on first use.
    pub fn write(&self, chunk: &[u8]) -> bool {
        if self.inner.borrow().completed {
            return false;
        }
        self.commit();
        let raw = {
            let mut inner = self.inner.borrow_mut();
            inner.streaming = true;
            Rc::clone(&inner.raw)
        };
        raw.write(chunk)
    }

    /// Streams a source as the response body.
    ///
    /// `total_size` selects sized framing (`Content-Length`); without it the
    /// body is chunked and ended when the source is exhausted. A client
    /// abort destroys the source.
    pub fn stream(&self, source: Rc<RefCell<dyn ReadableSource>>, total_size: Option<usize>) {
        if self.inner.borrow().completed {
            return;
        }
        let guard = Rc::clone(&source);
        self.on_abort(move || {
            if let Ok(mut source) = guard.try_borrow_mut() {
                source.destroy();
            }
        });
        self.commit();
        let bridge = StreamBridge {
            response: self.clone(),
            source: Rc::clone(&source),
            total: total_size,
        };
        source.borrow_mut().start(Box::new(bridge));
    }

    fn stream_chunk(
        &self,
        source: &Rc<RefCell<dyn ReadableSource>>,
        chunk: Vec<u8>,
        total: Option<usize>,
    ) -> bool {
        if self.inner.borrow().completed {
            // Post-completion writes are silent; let the source run out.
            return true;
        }
        self.commit();
        let raw = {
            let mut inner = self.inner.borrow_mut();
            inner.streaming = true;
            Rc::clone(&inner.raw)
        };

        let last_offset = raw.write_offset();
        let (accepted, done) = match total {
            Some(total) => raw.try_end(&chunk, total),
            None => (raw.write(&chunk), false),
        };
        if done {
            self.finish_streamed(source);
            return true;
        }
        if accepted {
            return true;
        }

        // Backpressure: the source pauses (push contract); retry the
        // unaccepted remainder when the transport drains, then resume it.
        debug!(
            request_id = %self.request().id(),
            offset = last_offset,
            chunk = chunk.len(),
            "stream backpressure, registering drain retry"
        );
        let response = self.clone();
        let source = Rc::clone(source);
        let retry = Rc::clone(&raw);
        raw.on_writable(Box::new(move |offset| {
            if response.inner.borrow().completed {
                return true;
            }
            let start = offset.saturating_sub(last_offset).min(chunk.len());
            let remainder = &chunk[start..];
            let (accepted, done) = match total {
                Some(total) => retry.try_end(remainder, total),
                None => (retry.write(remainder), false),
            };
            if done {
                response.finish_streamed(&source);
                return true;
            }
            if accepted {
                source.borrow_mut().resume();
            }
            accepted
        }));
        false
    }

    /// Sized streaming reported done by the transport.
    fn finish_streamed(&self, source: &Rc<RefCell<dyn ReadableSource>>) {
        let (request, close_hooks) = {
            let mut inner = self.inner.borrow_mut();
            if inner.completed {
                return;
            }
            inner.completed = true;
            (
                inner.request.clone(),
                std::mem::take(&mut inner.close_hooks),
            )
        };
        request.stop_streaming();
        if let Ok(mut source) = source.try_borrow_mut() {
            source.destroy();
        }
        for hook in close_hooks {
            hook();
        }
    }

    /// Drops the connection without a response.
    pub fn close(&self) {
        let (raw, request, close_hooks) = {
            let mut inner = self.inner.borrow_mut();
            if inner.completed {
                return;
            }
            inner.completed = true;
            (
                Rc::clone(&inner.raw),
                inner.request.clone(),
                std::mem::take(&mut inner.close_hooks),
            )
        };
        request.stop_streaming();
        raw.close();
        for hook in close_hooks {
            hook();
        }
    }

    // ---- errors & abort ----

    /// Routes an error to the exchange's error handler, at most once.
    pub fn throw(&self, error: HandlerError) {
        let routed = {
            let mut inner = self.inner.borrow_mut();
            if inner.error_handled {
                None
            } else {
                inner.error_handled = true;
                Some((Rc::clone(&inner.on_error), inner.request.clone()))
            }
        };
        match routed {
            Some((handler, request)) => handler(request, self.clone(), error),
            None => {
                error!(
                    request_id = %self.request().id(),
                    %error,
                    "error handler already ran for this exchange, dropping"
                );
            }
        }
    }

    fn handle_abort(&self) {
        let (request, abort_hooks, close_hooks) = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.completed = true;
            (
                inner.request.clone(),
                std::mem::take(&mut inner.abort_hooks),
                std::mem::take(&mut inner.close_hooks),
            )
        };
        debug!(request_id = %request.id(), "client aborted exchange");
        request.stop_streaming();
        for hook in abort_hooks {
            hook();
        }
        for hook in close_hooks {
            hook();
        }
    }
}

struct StreamBridge {
    response: Response,
    source: Rc<RefCell<dyn ReadableSource>>,
    total: Option<usize>,
}

impl StreamSink for StreamBridge {
    fn push(&mut self, chunk: Vec<u8>) -> bool {
        self.response.stream_chunk(&self.source, chunk, self.total)
    }

    fn end(&mut self) {
        // Sized mode finishes through try_end's done signal; chunked mode
        // needs the explicit end frame.
        if self.total.is_none() {
            let _ = self.response.send(None);
        }
    }
}
