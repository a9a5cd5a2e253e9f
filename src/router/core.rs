//! Router core module - registration records and publish/subscribe.

use std::cell::RefCell;
use std::rc::Rc;

use http::Method;
use tracing::debug;

use crate::dispatcher::{HandlerResult, MiddlewareFn, RouteHandlerFn};
use crate::error::ConfigError;
use crate::pattern::{merge_relative, RoutePattern};
use crate::request::Request;
use crate::response::Response;

/// Route method selector; `Any` matches every verb.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteMethod {
    Standard(Method),
    Any,
}

impl RouteMethod {
    /// Lowercase token handed to the engine's route binder.
    #[must_use]
    pub fn as_engine_str(&self) -> String {
        match self {
            Self::Standard(m) => m.as_str().to_ascii_lowercase(),
            Self::Any => "any".to_string(),
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard(m) => write!(f, "{m}"),
            Self::Any => write!(f, "ANY"),
        }
    }
}

/// Per-route registration options.
#[derive(Default)]
pub struct RouteOptions {
    pub(crate) middlewares: Vec<Rc<MiddlewareFn>>,
    pub(crate) max_body_length: Option<usize>,
    pub(crate) decorate_request: Option<Rc<dyn Fn(&Request)>>,
    pub(crate) decorate_response: Option<Rc<dyn Fn(&Response)>>,
}

impl Clone for RouteOptions {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.iter().map(Rc::clone).collect(),
            max_body_length: self.max_body_length,
            decorate_request: self.decorate_request.as_ref().map(Rc::clone),
            decorate_response: self.decorate_response.as_ref().map(Rc::clone),
        }
    }
}

impl RouteOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a route-specific (priority 2) middleware.
    #[must_use]
    pub fn middleware(
        mut self,
        f: impl Fn(Request, Response, crate::dispatcher::Next) -> HandlerResult + 'static,
    ) -> Self {
        self.middlewares.push(Rc::new(f));
        self
    }

    /// Overrides the server body ceiling for this route.
    #[must_use]
    pub fn max_body_length(mut self, bytes: usize) -> Self {
        self.max_body_length = Some(bytes);
        self
    }

    /// Hook for an external request-validation collaborator; runs before
    /// the chain.
    #[must_use]
    pub fn decorate_request(mut self, f: impl Fn(&Request) + 'static) -> Self {
        self.decorate_request = Some(Rc::new(f));
        self
    }

    /// Hook for an external response-decoration collaborator.
    #[must_use]
    pub fn decorate_response(mut self, f: impl Fn(&Response) + 'static) -> Self {
        self.decorate_response = Some(Rc::new(f));
        self
    }
}

/// Recorded route registration, replayed to subscribers.
pub struct RouteDraft {
    pub method: RouteMethod,
    pub pattern: String,
    pub options: RouteOptions,
    pub handler: Rc<RouteHandlerFn>,
}

/// Recorded middleware registration.
pub struct MiddlewareDraft {
    pub pattern: String,
    pub func: Rc<MiddlewareFn>,
}

/// Record stream delivered to subscribers.
pub enum RouterEvent {
    Route(Rc<RouteDraft>),
    Middleware(Rc<MiddlewareDraft>),
}

type Subscriber = Box<dyn Fn(&RouterEvent) -> Result<(), ConfigError>>;

struct RouterInner {
    routes: Vec<Rc<RouteDraft>>,
    middlewares: Vec<Rc<MiddlewareDraft>>,
    subscribers: Vec<Subscriber>,
}

/// Cheap-clone registration surface.
///
/// Clones share the same record store, so a clone can be handed to another
/// module for registration and mounted later.
#[derive(Clone)]
pub struct Router {
    inner: Rc<RefCell<RouterInner>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(RouterInner {
                routes: Vec::new(),
                middlewares: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Registers a route with explicit method and options.
    pub fn register(
        &self,
        method: RouteMethod,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        // Validate eagerly so the caller gets the error, not a subscriber.
        let _ = RoutePattern::parse(pattern)?;
        let draft = Rc::new(RouteDraft {
            method,
            pattern: pattern.to_string(),
            options,
            handler: Rc::new(handler),
        });
        self.publish_route(draft)
    }

    fn publish_route(&self, draft: Rc<RouteDraft>) -> Result<(), ConfigError> {
        debug!(method = %draft.method, pattern = %draft.pattern, "recording route");
        self.inner.borrow_mut().routes.push(Rc::clone(&draft));
        self.notify(&RouterEvent::Route(draft))
    }

    fn publish_middleware(&self, draft: Rc<MiddlewareDraft>) -> Result<(), ConfigError> {
        debug!(pattern = %draft.pattern, "recording middleware");
        self.inner.borrow_mut().middlewares.push(Rc::clone(&draft));
        self.notify(&RouterEvent::Middleware(draft))
    }

    fn notify(&self, event: &RouterEvent) -> Result<(), ConfigError> {
        // Subscribers may register further records (mount chains), so the
        // subscriber list cannot stay borrowed across calls.
        let count = self.inner.borrow().subscribers.len();
        for index in 0..count {
            let result = {
                let inner = self.inner.borrow();
                let Some(subscriber) = inner.subscribers.get(index) else {
                    break;
                };
                // The subscriber runs while `inner` is borrowed immutably;
                // it only mutates *other* routers (the parent's store).
                subscriber(event)
            };
            result?;
        }
        Ok(())
    }

    /// Subscribes to this router's records: all past records are replayed
    /// immediately, future ones are delivered as they are registered.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&RouterEvent) -> Result<(), ConfigError> + 'static,
    ) -> Result<(), ConfigError> {
        let (routes, middlewares) = {
            let inner = self.inner.borrow();
            (inner.routes.clone(), inner.middlewares.clone())
        };
        for draft in middlewares {
            subscriber(&RouterEvent::Middleware(draft))?;
        }
        for draft in routes {
            subscriber(&RouterEvent::Route(draft))?;
        }
        self.inner.borrow_mut().subscribers.push(Box::new(subscriber));
        Ok(())
    }

    /// Binds a middleware to a path prefix. Root (`/`) makes it global.
    pub fn use_middleware(
        &self,
        pattern: &str,
        f: impl Fn(Request, Response, crate::dispatcher::Next) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        Self::validate_mount_pattern(pattern)?;
        self.publish_middleware(Rc::new(MiddlewareDraft {
            pattern: pattern.to_string(),
            func: Rc::new(f),
        }))
    }

    /// Mounts a child router under a prefix, rewriting its patterns.
    pub fn use_router(&self, prefix: &str, child: &Router) -> Result<(), ConfigError> {
        Self::validate_mount_pattern(prefix)?;
        let parent = self.clone();
        let prefix = prefix.to_string();
        child.subscribe(move |event| match event {
            RouterEvent::Route(draft) => parent.publish_route(Rc::new(RouteDraft {
                method: draft.method.clone(),
                pattern: merge_relative(&prefix, &draft.pattern),
                options: draft.options.clone(),
                handler: Rc::clone(&draft.handler),
            })),
            RouterEvent::Middleware(draft) => {
                parent.publish_middleware(Rc::new(MiddlewareDraft {
                    pattern: merge_relative(&prefix, &draft.pattern),
                    func: Rc::clone(&draft.func),
                }))
            }
        })
    }

    fn validate_mount_pattern(pattern: &str) -> Result<(), ConfigError> {
        if pattern.contains('*') || pattern.contains(':') {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "mount patterns may not contain '*' or ':'".to_string(),
            });
        }
        if !pattern.starts_with('/') {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern must begin with '/'".to_string(),
            });
        }
        Ok(())
    }

    // ---- HTTP verb surface ----

    pub fn get(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::GET),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn get_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(RouteMethod::Standard(Method::GET), pattern, options, handler)
    }

    pub fn post(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::POST),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn post_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(RouteMethod::Standard(Method::POST), pattern, options, handler)
    }

    pub fn put(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::PUT),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn put_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(RouteMethod::Standard(Method::PUT), pattern, options, handler)
    }

    pub fn patch(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::PATCH),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn patch_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(RouteMethod::Standard(Method::PATCH), pattern, options, handler)
    }

    pub fn delete(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::DELETE),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn delete_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::DELETE),
            pattern,
            options,
            handler,
        )
    }

    pub fn head(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::HEAD),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn options(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::OPTIONS),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn trace(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::TRACE),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    pub fn connect(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(
            RouteMethod::Standard(Method::CONNECT),
            pattern,
            RouteOptions::default(),
            handler,
        )
    }

    /// Matches every verb.
    pub fn any(
        &self,
        pattern: &str,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(RouteMethod::Any, pattern, RouteOptions::default(), handler)
    }

    pub fn any_with(
        &self,
        pattern: &str,
        options: RouteOptions,
        handler: impl Fn(Request, Response) -> HandlerResult + 'static,
    ) -> Result<(), ConfigError> {
        self.register(RouteMethod::Any, pattern, options, handler)
    }
}
