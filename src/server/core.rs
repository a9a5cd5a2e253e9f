//! Server core module - route binding and exchange entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use http::Method;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{
    run_chain, HandlerResult, MiddlewareFn, Next, RouteHandlerFn,
};
use crate::engine::{Engine, ListenToken, RawRequest, RawResponse};
use crate::error::{ConfigError, HandlerError};
use crate::pattern::RoutePattern;
use crate::request::Request;
use crate::response::Response;
use crate::router::{Route, RouteDraft, RouteMethod, RouteOptions, Router, RouterEvent};

struct ServerInner {
    engine: Box<dyn Engine>,
    config: Rc<ServerConfig>,
    routes: HashMap<(RouteMethod, String), Rc<Route>>,
    /// Prefix-bound (priority 1) middlewares: `(prefix, seq, func)`.
    prefix_middlewares: Vec<(String, usize, Rc<MiddlewareFn>)>,
    /// Global (priority 0) middlewares, shared with every chain run.
    globals: Rc<Vec<Rc<MiddlewareFn>>>,
    /// Registration sequence; orders ties within a priority class.
    seq: usize,
    error_handler: Rc<crate::dispatcher::ErrorHandlerFn>,
    not_found: Option<Rc<RouteHandlerFn>>,
    locked: bool,
}

/// The application: routing surface plus engine lifecycle.
pub struct Server {
    router: Router,
    inner: Rc<RefCell<ServerInner>>,
}

impl Server {
    pub fn new(mut engine: Box<dyn Engine>, config: ServerConfig) -> Self {
        let config = config.with_env_overrides();
        engine.configure(&config);
        let inner = Rc::new(RefCell::new(ServerInner {
            engine,
            config: Rc::new(config),
            routes: HashMap::new(),
            prefix_middlewares: Vec::new(),
            globals: Rc::new(Vec::new()),
            seq: 0,
            error_handler: Rc::new(default_error_handler),
            not_found: None,
            locked: false,
        }));
        let router = Router::new();
        let record_sink = Rc::clone(&inner);
        // Subscribing to a brand-new router replays nothing and cannot fail.
        if let Err(unexpected) = router.subscribe(move |event| on_record(&record_sink, event)) {
            error!(error = %unexpected, "root router rejected its own subscriber");
        }
        Self { router, inner }
    }

    /// The root router; clones share the same record store.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    #[must_use]
    pub fn config(&self) -> Rc<ServerConfig> {
        Rc::clone(&self.inner.borrow().config)
    }

    /// Replaces the per-exchange error handler.
    pub fn set_error_handler(&self, f: impl Fn(Request, Response, HandlerError) + 'static) {
        self.inner.borrow_mut().error_handler = Rc::new(f);
    }

    /// Installs the handler bound as an `any /*` catchall at listen time.
    pub fn set_not_found_handler(
        &self,
        f: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        let mut inner = self.inner.borrow_mut();
        if inner.locked {
            return Err(ConfigError::RoutesLocked);
        }
        inner.not_found = Some(Rc::new(f));
        Ok(())
    }

    /// Locks the routing table and opens a listening socket.
    pub fn listen(&self, host: &str, port: u16) -> io::Result<ListenToken> {
        let not_found = self.inner.borrow_mut().not_found.take();
        if let Some(handler) = not_found {
            // Bound last so every explicit route wins; a user-registered
            // `any /*` simply keeps precedence.
            if let Err(err) = self.router.any("/*", move |req, res| handler(req, res)) {
                warn!(error = %err, "skipping not-found catchall binding");
            }
        }
        let mut inner = self.inner.borrow_mut();
        inner.locked = true;
        info!(host, port, "listening");
        inner.engine.listen(host, port)
    }

    /// Closes one listening socket, or all of them.
    pub fn close(&self, token: Option<ListenToken>) -> bool {
        self.inner.borrow_mut().engine.close(token)
    }

    // ---- routing surface (delegates to the root router) ----

    pub fn get(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.get(pattern, handler)
    }

    pub fn get_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.get_with(pattern, options, handler)
    }

    pub fn post(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.post(pattern, handler)
    }

    pub fn post_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.post_with(pattern, options, handler)
    }

    pub fn put(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.put(pattern, handler)
    }

    pub fn patch(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.patch(pattern, handler)
    }

    pub fn delete(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.delete(pattern, handler)
    }

    pub fn head(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.head(pattern, handler)
    }

    pub fn options(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.options(pattern, handler)
    }

    pub fn trace(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.trace(pattern, handler)
    }

    pub fn connect(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.connect(pattern, handler)
    }

    pub fn any(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.any(pattern, handler)
    }

    pub fn use_middleware(
        &self,
        pattern: &str,
        f: impl Fn(Request, Response, Next) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.router.use_middleware(pattern, f)
    }

    pub fn use_router(&self, prefix: &str, child: &Router) -> Result<(), ConfigError> {
        self.router.use_router(prefix, child)
    }
}

fn on_record(inner: &Rc<RefCell<ServerInner>>, event: &RouterEvent) -> Result<(), ConfigError> {
    match event {
        RouterEvent::Route(draft) => create_route(inner, draft),
        RouterEvent::Middleware(draft) => create_middleware(inner, draft),
    }
}

fn create_route(
    inner_rc: &Rc<RefCell<ServerInner>>,
    draft: &Rc<RouteDraft>,
) -> Result<(), ConfigError> {
    let pattern = RoutePattern::parse(&draft.pattern)?;
    let mut inner = inner_rc.borrow_mut();
    if inner.locked {
        return Err(ConfigError::RoutesLocked);
    }
    let key = (draft.method.clone(), draft.pattern.clone());
    if inner.routes.contains_key(&key) {
        return Err(ConfigError::DuplicateRoute {
            method: draft.method.to_string(),
            pattern: draft.pattern.clone(),
        });
    }

    let route = Rc::new(Route::new(
        draft.method.clone(),
        pattern,
        Rc::clone(&draft.handler),
        draft.options.max_body_length,
        draft.options.decorate_request.as_ref().map(Rc::clone),
        draft.options.decorate_response.as_ref().map(Rc::clone),
    ));

    // Prefix middlewares registered before this route apply to it too.
    for (prefix, seq, func) in &inner.prefix_middlewares {
        if prefix_applies(&draft.pattern, prefix) {
            route.push_middleware(1, *seq, Rc::clone(func));
        }
    }
    for func in &draft.options.middlewares {
        let seq = inner.seq;
        inner.seq += 1;
        route.push_middleware(2, seq, Rc::clone(func));
    }

    inner.routes.insert(key, Rc::clone(&route));

    let weak = Rc::downgrade(inner_rc);
    let bound = Rc::clone(&route);
    let method = draft.method.as_engine_str();
    inner.engine.register_route(
        &method,
        &draft.pattern,
        Box::new(move |raw_res, raw_req| {
            if let Some(inner) = weak.upgrade() {
                handle_exchange(&inner, &bound, raw_req, raw_res);
            }
        }),
    );
    info!(method = %draft.method, pattern = %draft.pattern, "route bound");
    Ok(())
}

fn create_middleware(
    inner_rc: &Rc<RefCell<ServerInner>>,
    draft: &Rc<crate::router::MiddlewareDraft>,
) -> Result<(), ConfigError> {
    let mut inner = inner_rc.borrow_mut();
    if inner.locked {
        return Err(ConfigError::RoutesLocked);
    }
    let seq = inner.seq;
    inner.seq += 1;
    if draft.pattern == "/" {
        let mut globals: Vec<Rc<MiddlewareFn>> =
            inner.globals.iter().map(Rc::clone).collect();
        globals.push(Rc::clone(&draft.func));
        inner.globals = Rc::new(globals);
        debug!(seq, "global middleware bound");
        return Ok(());
    }

    // A prefix middleware also reaches routes created before it.
    for ((_, pattern), route) in &inner.routes {
        if prefix_applies(pattern, &draft.pattern) {
            route.push_middleware(1, seq, Rc::clone(&draft.func));
        }
    }
    inner
        .prefix_middlewares
        .push((draft.pattern.clone(), seq, Rc::clone(&draft.func)));
    debug!(prefix = %draft.pattern, seq, "prefix middleware bound");
    Ok(())
}

fn prefix_applies(pattern: &str, prefix: &str) -> bool {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    if prefix.is_empty() {
        return true;
    }
    pattern == prefix || pattern.starts_with(&format!("{prefix}/"))
}

fn handle_exchange(
    inner_rc: &Rc<RefCell<ServerInner>>,
    route: &Rc<Route>,
    raw_req: &dyn RawRequest,
    raw_res: Rc<dyn RawResponse>,
) {
    let (config, error_handler, globals) = {
        let inner = inner_rc.borrow();
        (
            Rc::clone(&inner.config),
            Rc::clone(&inner.error_handler),
            Rc::clone(&inner.globals),
        )
    };
    let request = Request::new(
        raw_req,
        Rc::clone(&raw_res),
        route.pattern(),
        Rc::clone(&config),
    );
    let response = Response::new(request.clone(), Rc::clone(&raw_res), error_handler);
    debug!(
        request_id = %request.id(),
        method = %request.method(),
        path = %request.path(),
        "exchange start"
    );
    route.decorate(&request, &response);

    let content_length = request.content_length();
    if content_length > 0 {
        let limit = route.max_body_length().unwrap_or(config.max_body_length);
        let method = request.method();
        let body_allowed =
            method == Method::POST || method == Method::PUT || method == Method::PATCH;
        if content_length > limit || !body_allowed {
            let status = if body_allowed { 413 } else { 400 };
            if config.fast_abort {
                warn!(
                    request_id = %request.id(),
                    content_length,
                    limit,
                    "fast abort: closing connection"
                );
                response.close();
                return;
            }
            // Slow abort: drain the body, then answer with the error status.
            warn!(
                request_id = %request.id(),
                content_length,
                limit,
                status,
                "slow abort: draining body before rejecting"
            );
            let rejected = response.clone();
            raw_res.on_data(Box::new(move |_chunk, is_last| {
                if is_last {
                    let _ = rejected.status(status);
                    let _ = rejected.send(None);
                }
            }));
            return;
        }
        request.start_streaming();
    } else {
        request.stop_streaming();
    }

    run_chain(Rc::clone(route), globals, request, response);
}

fn default_error_handler(request: Request, response: Response, error: HandlerError) {
    error!(
        request_id = %request.id(),
        path = %request.path(),
        %error,
        "unhandled exchange error"
    );
    if response.is_completed() {
        return;
    }
    let code = error.response_status();
    let message = match &error {
        HandlerError::Status { message, .. } => message.clone(),
        _ => "Internal Server Error".to_string(),
    };
    if !response.is_initiated() {
        let _ = response.status(code);
    }
    let _ = response.send(Some(message.as_bytes()));
}
