//! Request context.
//!
//! Wraps the engine's volatile request handle. Everything the handle exposes
//! (method, path, query string, headers, positional path captures) is copied
//! out synchronously at construction because the handle dies with the route
//! callback. Derived views - query parameters, cookies, client addresses -
//! are computed lazily and cached.
//!
//! The inbound body is a little state machine: `Idle` until the server
//! decides the body is admissible, `Streaming` while chunks arrive from the
//! transport, `Ended` once the final chunk (or an early termination) lands.
//! Consumption APIs are callback-based and cached; asking for the body twice
//! never touches the transport twice.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use http::Method;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::ServerConfig;
use crate::engine::{RawRequest, RawResponse};
use crate::error::HandlerError;
use crate::ids::RequestId;
use crate::pattern::RoutePattern;

/// Inline capacity for header storage; typical requests fit on the stack.
pub const MAX_INLINE_HEADERS: usize = 16;
/// Inline capacity for path parameter storage.
pub const MAX_INLINE_PARAMS: usize = 8;

pub type HeaderVec = SmallVec<[(String, String); MAX_INLINE_HEADERS]>;
pub type ParamVec = SmallVec<[(String, String); MAX_INLINE_PARAMS]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Idle,
    Streaming,
    Ended,
}

struct PendingBody {
    cursor: usize,
    buffer: Vec<u8>,
}

type RawChunkSink = Rc<RefCell<dyn FnMut(&[u8], bool)>>;

struct RequestInner {
    raw: Rc<dyn RawResponse>,
    config: Rc<ServerConfig>,
    id: RequestId,
    method: Method,
    path: Rc<str>,
    query_string: Rc<str>,
    headers: HeaderVec,
    params: ParamVec,
    content_length: usize,

    query_cache: Option<Rc<HashMap<String, Vec<String>>>>,
    cookie_cache: Option<Rc<HashMap<String, String>>>,
    ip_cache: Option<Rc<str>>,
    proxy_ip_cache: Option<Rc<str>>,

    state: BodyState,
    pending: Option<PendingBody>,
    raw_sink: Option<RawChunkSink>,
    buffer_cache: Option<Rc<[u8]>>,
    text_cache: Option<Rc<str>>,
    json_cache: Option<Value>,
    urlencoded_cache: Option<Rc<HashMap<String, String>>>,
    waiters: Vec<Box<dyn FnOnce(Rc<[u8]>)>>,
    paused: bool,
}

/// Cheap-clone handle to one exchange's request state.
#[derive(Clone)]
pub struct Request {
    inner: Rc<RefCell<RequestInner>>,
}

impl Request {
    /// Captures everything from the volatile raw handle.
    pub(crate) fn new(
        raw_req: &dyn RawRequest,
        raw: Rc<dyn RawResponse>,
        pattern: &RoutePattern,
        config: Rc<ServerConfig>,
    ) -> Self {
        let method = Method::from_bytes(raw_req.method().to_ascii_uppercase().as_bytes())
            .unwrap_or(Method::GET);
        let path: Rc<str> = raw_req.url().into();
        let query_string: Rc<str> = raw_req.query().into();

        let mut headers = HeaderVec::new();
        raw_req.for_each_header(&mut |name, value| {
            headers.push((name.to_string(), value.to_string()));
        });

        let mut params = ParamVec::new();
        for (name, index) in pattern.params() {
            if let Some(value) = raw_req.parameter(*index) {
                params.push((name.clone(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0);

        let id = RequestId::from_header_or_new(
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("x-request-id"))
                .map(|(_, v)| v.as_str()),
        );

        Self {
            inner: Rc::new(RefCell::new(RequestInner {
                raw,
                config,
                id,
                method,
                path,
                query_string,
                headers,
                params,
                content_length,
                query_cache: None,
                cookie_cache: None,
                ip_cache: None,
                proxy_ip_cache: None,
                state: BodyState::Idle,
                pending: None,
                raw_sink: None,
                buffer_cache: None,
                text_cache: None,
                json_cache: None,
                urlencoded_cache: None,
                waiters: Vec::new(),
                paused: false,
            })),
        }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.inner.borrow().id
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.inner.borrow().method.clone()
    }

    #[must_use]
    pub fn path(&self) -> Rc<str> {
        Rc::clone(&self.inner.borrow().path)
    }

    /// Raw query string without the leading `?`.
    #[must_use]
    pub fn query_string(&self) -> Rc<str> {
        Rc::clone(&self.inner.borrow().query_string)
    }

    #[must_use]
    pub fn content_length(&self) -> usize {
        self.inner.borrow().content_length
    }

    /// Case-insensitive header lookup; `referer`/`referrer` alias each other.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        let inner = self.inner.borrow();
        let direct = Self::find_header(&inner.headers, name);
        if direct.is_some() {
            return direct;
        }
        match name.to_ascii_lowercase().as_str() {
            "referer" => Self::find_header(&inner.headers, "referrer"),
            "referrer" => Self::find_header(&inner.headers, "referer"),
            _ => None,
        }
    }

    fn find_header(headers: &HeaderVec, name: &str) -> Option<String> {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// All headers in arrival order.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        self.inner.borrow().headers.iter().cloned().collect()
    }

    /// First value of a path parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<String> {
        self.inner
            .borrow()
            .params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// All values of a path parameter in declaration order; duplicate names
    /// across mounted prefixes accumulate instead of overwriting.
    #[must_use]
    pub fn param_values(&self, name: &str) -> Vec<String> {
        self.inner
            .borrow()
            .params
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Decoded query parameters, grouped by name. Parsed once, then cached.
    #[must_use]
    pub fn query_params(&self) -> Rc<HashMap<String, Vec<String>>> {
        if let Some(cached) = &self.inner.borrow().query_cache {
            return Rc::clone(cached);
        }
        let parsed: Rc<HashMap<String, Vec<String>>> = {
            let inner = self.inner.borrow();
            let mut map: HashMap<String, Vec<String>> = HashMap::new();
            for (name, value) in url::form_urlencoded::parse(inner.query_string.as_bytes()) {
                map.entry(name.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
            Rc::new(map)
        };
        self.inner.borrow_mut().query_cache = Some(Rc::clone(&parsed));
        parsed
    }

    /// First value of a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params()
            .get(name)
            .and_then(|values| values.first().cloned())
    }

    /// Request cookies, parsed once from the `Cookie` header.
    #[must_use]
    pub fn cookies(&self) -> Rc<HashMap<String, String>> {
        if let Some(cached) = &self.inner.borrow().cookie_cache {
            return Rc::clone(cached);
        }
        let parsed = Rc::new(
            self.header("cookie")
                .map(|h| crate::cookies::parse(&h))
                .unwrap_or_default(),
        );
        self.inner.borrow_mut().cookie_cache = Some(Rc::clone(&parsed));
        parsed
    }

    /// Verifies and returns a signed cookie value.
    #[must_use]
    pub fn cookie_signed(&self, name: &str, secret: &str) -> Option<String> {
        self.cookies()
            .get(name)
            .and_then(|signed| crate::cookies::unsign(signed, secret))
    }

    /// Client address. With `trust_proxy` enabled the proxied address wins
    /// when the engine reports one.
    #[must_use]
    pub fn ip(&self) -> Rc<str> {
        let trust_proxy = self.inner.borrow().config.trust_proxy;
        if trust_proxy {
            let proxied = self.proxy_ip();
            if !proxied.is_empty() {
                return proxied;
            }
        }
        if let Some(cached) = &self.inner.borrow().ip_cache {
            return Rc::clone(cached);
        }
        let formatted: Rc<str> = {
            let inner = self.inner.borrow();
            format_binary_address(&inner.raw.remote_address()).into()
        };
        self.inner.borrow_mut().ip_cache = Some(Rc::clone(&formatted));
        formatted
    }

    /// Address reported by a fronting proxy, empty when absent.
    #[must_use]
    pub fn proxy_ip(&self) -> Rc<str> {
        if let Some(cached) = &self.inner.borrow().proxy_ip_cache {
            return Rc::clone(cached);
        }
        let formatted: Rc<str> = {
            let inner = self.inner.borrow();
            format_binary_address(&inner.raw.proxied_remote_address()).into()
        };
        self.inner.borrow_mut().proxy_ip_cache = Some(Rc::clone(&formatted));
        formatted
    }

    // ---- inbound body ----

    /// Begins pulling body chunks from the transport. Invoked by the server
    /// once the body-size policy admits the body.
    pub(crate) fn start_streaming(&self) {
        let raw = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != BodyState::Idle {
                return;
            }
            inner.state = BodyState::Streaming;
            inner.pending = Some(PendingBody {
                cursor: 0,
                buffer: vec![0; inner.content_length],
            });
            Rc::clone(&inner.raw)
        };
        let this = self.clone();
        raw.on_data(Box::new(move |chunk, is_last| {
            this.deliver_chunk(chunk, is_last);
        }));
    }

    /// Terminates body intake, finalizing whatever arrived so far. Pending
    /// consumers settle with the partial (possibly empty) buffer.
    pub(crate) fn stop_streaming(&self) {
        self.finish_body();
    }

    /// Opts into raw chunk delivery, bypassing the internal buffer. Must be
    /// installed before the first chunk arrives (i.e. synchronously inside
    /// the chain); chunks already buffered are not replayed.
    pub fn on_body_chunk(&self, sink: impl FnMut(&[u8], bool) + 'static) {
        self.inner.borrow_mut().raw_sink = Some(Rc::new(RefCell::new(sink)));
    }

    fn deliver_chunk(&self, chunk: &[u8], is_last: bool) {
        let sink = {
            let inner = self.inner.borrow();
            if inner.state == BodyState::Ended {
                return;
            }
            inner.raw_sink.clone()
        };
        if let Some(sink) = sink {
            (sink.borrow_mut())(chunk, is_last);
        } else {
            let mut inner = self.inner.borrow_mut();
            if let Some(pending) = inner.pending.as_mut() {
                let end = (pending.cursor + chunk.len()).min(pending.buffer.len());
                let take = end - pending.cursor;
                pending.buffer[pending.cursor..end].copy_from_slice(&chunk[..take]);
                pending.cursor = end;
            }
        }
        if is_last {
            self.finish_body();
        }
    }

    fn finish_body(&self) {
        let (buffer, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == BodyState::Ended && inner.buffer_cache.is_some() {
                return;
            }
            inner.state = BodyState::Ended;
            let buffer: Rc<[u8]> = match inner.buffer_cache.clone() {
                Some(cached) => cached,
                None => {
                    let bytes = inner
                        .pending
                        .take()
                        .map(|PendingBody { cursor, mut buffer }| {
                            buffer.truncate(cursor);
                            buffer
                        })
                        .unwrap_or_default();
                    let rc: Rc<[u8]> = bytes.into();
                    inner.buffer_cache = Some(Rc::clone(&rc));
                    rc
                }
            };
            (buffer, std::mem::take(&mut inner.waiters))
        };
        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "body complete, settling consumers");
        }
        for waiter in waiters {
            waiter(Rc::clone(&buffer));
        }
    }

    /// Pauses transport delivery. Returns `false` when already paused or the
    /// body has ended.
    pub fn pause(&self) -> bool {
        let raw = {
            let mut inner = self.inner.borrow_mut();
            if inner.paused || inner.state == BodyState::Ended {
                return false;
            }
            inner.paused = true;
            Rc::clone(&inner.raw)
        };
        raw.pause();
        true
    }

    /// Resumes transport delivery. Returns `false` when not paused.
    pub fn resume(&self) -> bool {
        let raw = {
            let mut inner = self.inner.borrow_mut();
            if !inner.paused {
                return false;
            }
            inner.paused = false;
            Rc::clone(&inner.raw)
        };
        raw.resume();
        true
    }

    /// Full body bytes. Resolves immediately from cache when available,
    /// otherwise once the final chunk arrives.
    pub fn buffer(&self, cb: impl FnOnce(Rc<[u8]>) + 'static) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            match (&inner.buffer_cache, inner.state) {
                (Some(cached), _) => Some(Rc::clone(cached)),
                (None, BodyState::Ended) => {
                    let rc: Rc<[u8]> = Vec::new().into();
                    inner.buffer_cache = Some(Rc::clone(&rc));
                    Some(rc)
                }
                _ => {
                    inner.waiters.push(Box::new(cb));
                    return;
                }
            }
        };
        if let Some(buffer) = ready {
            cb(buffer);
        }
    }

    /// Body decoded as UTF-8 text (lossy), cached.
    pub fn text(&self, cb: impl FnOnce(Rc<str>) + 'static) {
        if let Some(cached) = &self.inner.borrow().text_cache {
            let cached = Rc::clone(cached);
            cb(cached);
            return;
        }
        let this = self.clone();
        self.buffer(move |bytes| {
            let text: Rc<str> = String::from_utf8_lossy(&bytes).into_owned().into();
            this.inner.borrow_mut().text_cache = Some(Rc::clone(&text));
            cb(text);
        });
    }

    /// Body parsed as JSON. With a `default`, parse failures resolve to the
    /// default instead of erroring. Successful values are cached.
    pub fn json(
        &self,
        default: Option<Value>,
        cb: impl FnOnce(Result<Value, HandlerError>) + 'static,
    ) {
        if let Some(cached) = &self.inner.borrow().json_cache {
            let cached = cached.clone();
            cb(Ok(cached));
            return;
        }
        let this = self.clone();
        self.text(move |text| {
            let result = match serde_json::from_str::<Value>(&text) {
                Ok(value) => Ok(value),
                Err(err) => match default {
                    Some(fallback) => Ok(fallback),
                    None => Err(HandlerError::from(err)),
                },
            };
            if let Ok(value) = &result {
                this.inner.borrow_mut().json_cache = Some(value.clone());
            }
            cb(result);
        });
    }

    /// Body parsed as `application/x-www-form-urlencoded`, cached.
    pub fn urlencoded(&self, cb: impl FnOnce(Rc<HashMap<String, String>>) + 'static) {
        if let Some(cached) = &self.inner.borrow().urlencoded_cache {
            let cached = Rc::clone(cached);
            cb(cached);
            return;
        }
        let this = self.clone();
        self.buffer(move |bytes| {
            let mut map = HashMap::new();
            for (name, value) in url::form_urlencoded::parse(&bytes) {
                map.insert(name.into_owned(), value.into_owned());
            }
            let map = Rc::new(map);
            this.inner.borrow_mut().urlencoded_cache = Some(Rc::clone(&map));
            cb(map);
        });
    }
}

/// Formats an engine binary address: 4 bytes as dotted quad, 16 bytes as
/// colon-separated hex groups.
fn format_binary_address(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]),
        16 => bytes
            .chunks(2)
            .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
            .collect::<Vec<_>>()
            .join(":"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::format_binary_address;

    #[test]
    fn formats_ipv4() {
        assert_eq!(format_binary_address(&[127, 0, 0, 1]), "127.0.0.1");
    }

    #[test]
    fn formats_ipv6() {
        let mut addr = [0u8; 16];
        addr[15] = 1;
        assert_eq!(
            format_binary_address(&addr),
            "0000:0000:0000:0000:0000:0000:0000:0001"
        );
    }

    #[test]
    fn unknown_width_is_empty() {
        assert_eq!(format_binary_address(&[1, 2, 3]), "");
    }
}
