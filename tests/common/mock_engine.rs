//! Scriptable in-process engine for integration tests.
//!
//! Implements the full engine contract over plain `Rc`/`RefCell` state so
//! tests can drive exchanges synchronously: deliver body chunks, constrain
//! the transport write budget to provoke backpressure, trigger aborts, and
//! inspect everything the response layer wrote.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use expresslane::engine::{Engine, ExchangeHandler, ListenToken, RawRequest, RawResponse};
use expresslane::ServerConfig;

struct MockRoute {
    method: String,
    pattern: String,
    handler: ExchangeHandler,
}

#[derive(Default)]
struct MockEngineInner {
    routes: Vec<Rc<MockRoute>>,
    listening: Vec<ListenToken>,
    next_token: u64,
    config: Option<ServerConfig>,
}

/// Cheap-clone engine handle; clone one half into the server and keep the
/// other for driving exchanges.
#[derive(Clone, Default)]
pub struct MockEngine {
    inner: Rc<RefCell<MockEngineInner>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_count(&self) -> usize {
        self.inner.borrow().routes.len()
    }

    pub fn is_listening(&self) -> bool {
        !self.inner.borrow().listening.is_empty()
    }

    /// The options handed over at server construction, if any.
    pub fn configured_with(&self) -> Option<ServerConfig> {
        self.inner.borrow().config.clone()
    }

    /// Routes a request exactly like the engine would (registration order,
    /// `any` matches every verb) and runs the bound handler. Returns the
    /// exchange recorder, or `None` when no route matched.
    pub fn dispatch(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
    ) -> Option<Rc<MockExchange>> {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        let verb = method.to_ascii_lowercase();
        let matched = {
            let inner = self.inner.borrow();
            inner.routes.iter().find_map(|route| {
                if route.method != verb && route.method != "any" {
                    return None;
                }
                match_pattern(&route.pattern, path).map(|params| (Rc::clone(route), params))
            })
        };
        let (route, params) = matched?;
        let exchange = Rc::new(MockExchange::new(method, path, query, headers, params));
        (route.handler)(
            Rc::clone(&exchange) as Rc<dyn RawResponse>,
            exchange.as_ref() as &dyn RawRequest,
        );
        Some(exchange)
    }
}

impl Engine for MockEngine {
    fn configure(&mut self, config: &ServerConfig) {
        self.inner.borrow_mut().config = Some(config.clone());
    }

    fn register_route(&mut self, method: &str, pattern: &str, handler: ExchangeHandler) {
        self.inner.borrow_mut().routes.push(Rc::new(MockRoute {
            method: method.to_string(),
            pattern: pattern.to_string(),
            handler,
        }));
    }

    fn listen(&mut self, _host: &str, _port: u16) -> io::Result<ListenToken> {
        let mut inner = self.inner.borrow_mut();
        inner.next_token += 1;
        let token = ListenToken(inner.next_token);
        inner.listening.push(token);
        Ok(token)
    }

    fn close(&mut self, token: Option<ListenToken>) -> bool {
        let mut inner = self.inner.borrow_mut();
        match token {
            Some(token) => {
                let before = inner.listening.len();
                inner.listening.retain(|t| *t != token);
                inner.listening.len() != before
            }
            None => {
                let had = !inner.listening.is_empty();
                inner.listening.clear();
                had
            }
        }
    }
}

fn match_pattern(pattern: &str, path: &str) -> Option<Vec<String>> {
    let pattern_segments: Vec<&str> = pattern.split('/').skip(1).collect();
    let path_segments: Vec<&str> = path.split('/').skip(1).collect();
    let mut params = Vec::new();
    for (index, segment) in pattern_segments.iter().enumerate() {
        if *segment == "*" {
            return Some(params);
        }
        let actual = path_segments.get(index)?;
        if segment.starts_with(':') && segment.len() > 2 {
            params.push((*actual).to_string());
        } else if segment != actual {
            return None;
        }
    }
    (path_segments.len() == pattern_segments.len()).then_some(params)
}

#[derive(Default)]
pub struct MockState {
    pub status: Option<(u16, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub ended: bool,
    pub ended_without_body: bool,
    pub closed: bool,
    pub close_on_end: bool,
    pub corked: usize,
    pub pauses: usize,
    pub resumes: usize,
    pub aborted: bool,
    pub total_size: Option<usize>,
    /// Bytes the transport accepts before refusing; `None` is unlimited.
    pub write_budget: Option<usize>,
    on_aborted: Option<Box<dyn FnOnce()>>,
    on_data: Option<Box<dyn FnMut(&[u8], bool)>>,
    on_writable: Option<Box<dyn FnMut(usize) -> bool>>,
}

/// One recorded exchange; implements both raw-handle traits.
pub struct MockExchange {
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    params: Vec<String>,
    pub proxied_addr: RefCell<Vec<u8>>,
    pub state: RefCell<MockState>,
}

impl MockExchange {
    fn new(
        method: &str,
        path: &str,
        query: &str,
        headers: &[(&str, &str)],
        params: Vec<String>,
    ) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            params,
            proxied_addr: RefCell::new(Vec::new()),
            state: RefCell::new(MockState::default()),
        }
    }

    // ---- test drivers ----

    /// Feeds body chunks through the registered data observer; the final
    /// chunk is flagged last.
    pub fn deliver_body(&self, chunks: &[&[u8]]) {
        let mut cb = self.state.borrow_mut().on_data.take();
        if let Some(cb) = cb.as_mut() {
            let count = chunks.len();
            for (index, chunk) in chunks.iter().enumerate() {
                cb(chunk, index + 1 == count);
            }
        }
        let mut state = self.state.borrow_mut();
        if state.on_data.is_none() {
            state.on_data = cb;
        }
    }

    pub fn has_data_observer(&self) -> bool {
        self.state.borrow().on_data.is_some()
    }

    /// Simulates a client abort.
    pub fn trigger_abort(&self) {
        let cb = {
            let mut state = self.state.borrow_mut();
            state.aborted = true;
            state.on_aborted.take()
        };
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Fires the registered drain callback with the current write offset.
    /// Returns `true` when the callback declared itself finished (or none
    /// was registered).
    pub fn drain(&self) -> bool {
        let cb = self.state.borrow_mut().on_writable.take();
        let Some(mut cb) = cb else {
            return true;
        };
        let offset = self.state.borrow().body.len();
        let finished = cb(offset);
        if !finished {
            self.state.borrow_mut().on_writable = Some(cb);
        }
        finished
    }

    pub fn has_drain_observer(&self) -> bool {
        self.state.borrow().on_writable.is_some()
    }

    pub fn set_write_budget(&self, bytes: usize) {
        self.state.borrow_mut().write_budget = Some(bytes);
    }

    pub fn add_write_budget(&self, bytes: usize) {
        let mut state = self.state.borrow_mut();
        let current = state.write_budget.unwrap_or(0);
        state.write_budget = Some(current + bytes);
    }

    pub fn set_proxied_addr(&self, addr: Vec<u8>) {
        *self.proxied_addr.borrow_mut() = addr;
    }

    // ---- assertions ----

    pub fn status(&self) -> Option<u16> {
        self.state.borrow().status.as_ref().map(|(code, _)| *code)
    }

    pub fn reason(&self) -> Option<String> {
        self.state
            .borrow()
            .status
            .as_ref()
            .map(|(_, reason)| reason.clone())
    }

    pub fn response_header(&self, name: &str) -> Option<String> {
        self.state
            .borrow()
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn response_headers(&self, name: &str) -> Vec<String> {
        self.state
            .borrow()
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        self.state.borrow().body.clone()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().body).into_owned()
    }

    pub fn is_ended(&self) -> bool {
        self.state.borrow().ended
    }

    pub fn ended_without_body(&self) -> bool {
        self.state.borrow().ended_without_body
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn cork_count(&self) -> usize {
        self.state.borrow().corked
    }

    pub fn pause_count(&self) -> usize {
        self.state.borrow().pauses
    }

    pub fn resume_count(&self) -> usize {
        self.state.borrow().resumes
    }

    pub fn declared_total_size(&self) -> Option<usize> {
        self.state.borrow().total_size
    }

    fn accept(&self, chunk: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        match state.write_budget {
            None => {
                state.body.extend_from_slice(chunk);
                true
            }
            Some(budget) => {
                let take = chunk.len().min(budget);
                state.body.extend_from_slice(&chunk[..take]);
                state.write_budget = Some(budget - take);
                take == chunk.len()
            }
        }
    }
}

impl RawRequest for MockExchange {
    fn method(&self) -> &str {
        &self.method
    }

    fn url(&self) -> &str {
        &self.path
    }

    fn query(&self) -> &str {
        &self.query
    }

    fn for_each_header(&self, f: &mut dyn FnMut(&str, &str)) {
        for (name, value) in &self.headers {
            f(name, value);
        }
    }

    fn parameter(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

impl RawResponse for MockExchange {
    fn on_aborted(&self, cb: Box<dyn FnOnce()>) {
        self.state.borrow_mut().on_aborted = Some(cb);
    }

    fn on_data(&self, cb: Box<dyn FnMut(&[u8], bool)>) {
        self.state.borrow_mut().on_data = Some(cb);
    }

    fn on_writable(&self, cb: Box<dyn FnMut(usize) -> bool>) {
        self.state.borrow_mut().on_writable = Some(cb);
    }

    fn write_status(&self, code: u16, reason: &str) {
        self.state.borrow_mut().status = Some((code, reason.to_string()));
    }

    fn write_header(&self, name: &str, value: &str) {
        self.state
            .borrow_mut()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    fn write(&self, chunk: &[u8]) -> bool {
        self.accept(chunk)
    }

    fn try_end(&self, chunk: &[u8], total_size: usize) -> (bool, bool) {
        self.state.borrow_mut().total_size = Some(total_size);
        let accepted = self.accept(chunk);
        let done = accepted && self.state.borrow().body.len() >= total_size;
        if done {
            self.state.borrow_mut().ended = true;
        }
        (accepted, done)
    }

    fn end(&self, body: Option<&[u8]>, close_connection: bool) -> bool {
        let mut state = self.state.borrow_mut();
        if state.ended {
            return false;
        }
        if let Some(body) = body {
            state.body.extend_from_slice(body);
        }
        state.ended = true;
        state.close_on_end = close_connection;
        true
    }

    fn end_without_body(&self) {
        let mut state = self.state.borrow_mut();
        state.ended = true;
        state.ended_without_body = true;
    }

    fn pause(&self) {
        self.state.borrow_mut().pauses += 1;
    }

    fn resume(&self) {
        self.state.borrow_mut().resumes += 1;
    }

    fn close(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.ended = true;
    }

    fn cork(&self, f: Box<dyn FnOnce()>) {
        self.state.borrow_mut().corked += 1;
        f();
    }

    fn write_offset(&self) -> usize {
        self.state.borrow().body.len()
    }

    fn remote_address(&self) -> Vec<u8> {
        vec![127, 0, 0, 1]
    }

    fn proxied_remote_address(&self) -> Vec<u8> {
        self.proxied_addr.borrow().clone()
    }
}
