mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::make_server;
use expresslane::{Completion, HandlerError, Outcome, RouteOptions};

type Log = Rc<RefCell<Vec<&'static str>>>;

fn record(log: &Log, entry: &'static str) {
    log.borrow_mut().push(entry);
}

#[test]
fn middlewares_run_global_then_prefix_then_route_then_handler() {
    let (server, engine) = make_server();
    let log: Log = Rc::default();

    // Registered in reverse priority order on purpose; the chain must still
    // run global, prefix, route-specific, handler.
    let l = Rc::clone(&log);
    server
        .get_with(
            "/api/items",
            RouteOptions::new().middleware(move |_req, _res, next| {
                record(&l, "route");
                next.ok();
                Ok(Outcome::Completed)
            }),
            {
                let l = Rc::clone(&log);
                move |_req, res| {
                    record(&l, "handler");
                    res.send(Some(b"done"));
                    Ok(Outcome::Completed)
                }
            },
        )
        .unwrap();

    let l = Rc::clone(&log);
    server
        .use_middleware("/api", move |_req, _res, next| {
            record(&l, "prefix");
            next.ok();
            Ok(Outcome::Completed)
        })
        .unwrap();

    let l = Rc::clone(&log);
    server
        .use_middleware("/", move |_req, _res, next| {
            record(&l, "global");
            next.ok();
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/api/items", &[]).unwrap();
    assert_eq!(exchange.body_string(), "done");
    assert_eq!(*log.borrow(), vec!["global", "prefix", "route", "handler"]);
}

#[test]
fn same_priority_middlewares_keep_registration_order() {
    let (server, engine) = make_server();
    let log: Log = Rc::default();

    for entry in ["first", "second", "third"] {
        let l = Rc::clone(&log);
        server
            .use_middleware("/", move |_req, _res, next| {
                record(&l, entry);
                next.ok();
                Ok(Outcome::Completed)
            })
            .unwrap();
    }
    server
        .get("/x", |_req, res| {
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    engine.dispatch("GET", "/x", &[]).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn prefix_middleware_reaches_routes_registered_before_it() {
    let (server, engine) = make_server();
    let log: Log = Rc::default();

    let l = Rc::clone(&log);
    server
        .get("/admin/panel", move |_req, res| {
            record(&l, "handler");
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    let l = Rc::clone(&log);
    server
        .use_middleware("/admin", move |_req, _res, next| {
            record(&l, "guard");
            next.ok();
            Ok(Outcome::Completed)
        })
        .unwrap();

    engine.dispatch("GET", "/admin/panel", &[]).unwrap();
    assert_eq!(*log.borrow(), vec!["guard", "handler"]);
}

#[test]
fn prefix_middleware_does_not_leak_to_sibling_trees() {
    let (server, engine) = make_server();
    let log: Log = Rc::default();

    let l = Rc::clone(&log);
    server
        .use_middleware("/admin", move |_req, _res, next| {
            record(&l, "guard");
            next.ok();
            Ok(Outcome::Completed)
        })
        .unwrap();
    // Prefix matching is per path segment: /administrator is not /admin.
    server
        .get("/administrator", |_req, res| {
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    engine.dispatch("GET", "/administrator", &[]).unwrap();
    assert!(log.borrow().is_empty());
}

#[test]
fn middleware_that_responds_without_next_ends_the_chain() {
    let (server, engine) = make_server();
    let reached: Rc<RefCell<bool>> = Rc::default();

    server
        .use_middleware("/", |_req, res, _next| {
            res.status(403)?;
            res.send(Some(b"forbidden"));
            Ok(Outcome::Completed)
        })
        .unwrap();
    let r = Rc::clone(&reached);
    server
        .get("/private", move |_req, res| {
            *r.borrow_mut() = true;
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/private", &[]).unwrap();
    assert_eq!(exchange.status(), Some(403));
    assert_eq!(exchange.body_string(), "forbidden");
    assert!(!*reached.borrow());
}

#[test]
fn deferred_middleware_resumes_the_chain_on_resolve() {
    let (server, engine) = make_server();
    let slot: Rc<RefCell<Option<Completion>>> = Rc::default();

    let s = Rc::clone(&slot);
    server
        .use_middleware("/", move |_req, _res, _next| {
            let (outcome, completion) = Outcome::deferred();
            s.borrow_mut().replace(completion);
            Ok(outcome)
        })
        .unwrap();
    server
        .get("/slow", |_req, res| {
            res.send(Some(b"finally"));
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/slow", &[]).unwrap();
    assert!(!exchange.is_ended());

    slot.borrow_mut().take().unwrap().resolve();
    assert!(exchange.is_ended());
    assert_eq!(exchange.body_string(), "finally");
}

#[test]
fn deferred_rejection_routes_into_the_error_handler() {
    let (server, engine) = make_server();
    let slot: Rc<RefCell<Option<Completion>>> = Rc::default();

    let s = Rc::clone(&slot);
    server
        .use_middleware("/", move |_req, _res, _next| {
            let (outcome, completion) = Outcome::deferred();
            s.borrow_mut().replace(completion);
            Ok(outcome)
        })
        .unwrap();
    server
        .get("/slow", |_req, res| {
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/slow", &[]).unwrap();
    slot.borrow_mut()
        .take()
        .unwrap()
        .reject(HandlerError::status(401, "denied"));

    assert_eq!(exchange.status(), Some(401));
    assert_eq!(exchange.body_string(), "denied");
}

#[test]
fn settlement_before_the_chain_looks_runs_immediately() {
    let (server, engine) = make_server();

    server
        .use_middleware("/", |_req, _res, _next| {
            let (outcome, completion) = Outcome::deferred();
            // Settled before the chain ever sees the deferred half.
            completion.resolve();
            Ok(outcome)
        })
        .unwrap();
    server
        .get("/eager", |_req, res| {
            res.send(Some(b"ran"));
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/eager", &[]).unwrap();
    assert_eq!(exchange.body_string(), "ran");
}

#[test]
fn handler_error_reaches_the_default_error_handler() {
    let (server, engine) = make_server();
    server
        .get("/teapot", |_req, _res| {
            Err(HandlerError::status(418, "short and stout"))
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/teapot", &[]).unwrap();
    assert_eq!(exchange.status(), Some(418));
    assert_eq!(exchange.body_string(), "short and stout");
}

#[test]
fn opaque_errors_become_internal_server_errors() {
    let (server, engine) = make_server();
    server
        .get("/boom", |_req, _res| {
            Err(HandlerError::Message("disk fell off".to_string()))
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/boom", &[]).unwrap();
    assert_eq!(exchange.status(), Some(500));
    assert_eq!(exchange.body_string(), "Internal Server Error");
}

#[test]
fn custom_error_handler_replaces_the_default() {
    let (server, engine) = make_server();
    server.set_error_handler(|_req, res, error| {
        let _ = res.status(error.response_status());
        res.send(Some(b"custom"));
    });
    server
        .get("/boom", |_req, _res| Err(HandlerError::status(502, "bad")))
        .unwrap();

    let exchange = engine.dispatch("GET", "/boom", &[]).unwrap();
    assert_eq!(exchange.status(), Some(502));
    assert_eq!(exchange.body_string(), "custom");
}

#[test]
fn error_handler_runs_at_most_once_per_exchange() {
    let (server, engine) = make_server();
    let calls: Rc<RefCell<usize>> = Rc::default();

    let c = Rc::clone(&calls);
    server.set_error_handler(move |_req, res, _error| {
        *c.borrow_mut() += 1;
        let _ = res.status(500);
        res.send(None);
    });
    server
        .use_middleware("/", |_req, _res, next| {
            next.err(HandlerError::status(400, "first"));
            next.err(HandlerError::status(400, "second"));
            Ok(Outcome::Completed)
        })
        .unwrap();
    server
        .get("/x", |_req, res| {
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    engine.dispatch("GET", "/x", &[]).unwrap();
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn double_continuation_is_a_protocol_violation() {
    let (server, engine) = make_server();
    let seen: Rc<RefCell<Option<HandlerError>>> = Rc::default();

    let s = Rc::clone(&seen);
    server.set_error_handler(move |_req, _res, error| {
        s.borrow_mut().replace(error);
    });
    server
        .use_middleware("/", |_req, _res, next| {
            next.ok();
            next.ok();
            Ok(Outcome::Completed)
        })
        .unwrap();
    server
        .get("/x", |_req, res| {
            res.send(Some(b"once"));
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/x", &[]).unwrap();
    // The first continuation ran the handler normally.
    assert_eq!(exchange.body_string(), "once");
    let error = seen.borrow_mut().take().unwrap();
    assert!(matches!(error, HandlerError::Protocol(_)));
}

#[test]
fn continuations_after_abort_are_silent() {
    let (server, engine) = make_server();
    let slot: Rc<RefCell<Option<Completion>>> = Rc::default();
    let calls: Rc<RefCell<usize>> = Rc::default();

    let c = Rc::clone(&calls);
    server.set_error_handler(move |_req, _res, _error| {
        *c.borrow_mut() += 1;
    });
    let s = Rc::clone(&slot);
    server
        .use_middleware("/", move |_req, _res, _next| {
            let (outcome, completion) = Outcome::deferred();
            s.borrow_mut().replace(completion);
            Ok(outcome)
        })
        .unwrap();
    server
        .get("/x", |_req, res| {
            res.send(None);
            Ok(Outcome::Completed)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/x", &[]).unwrap();
    exchange.trigger_abort();
    slot.borrow_mut().take().unwrap().resolve();

    assert!(exchange.status().is_none());
    assert_eq!(*calls.borrow(), 0);
}

#[test]
fn deferred_handler_rejection_reaches_the_error_handler() {
    let (server, engine) = make_server();
    let slot: Rc<RefCell<Option<Completion>>> = Rc::default();

    let s = Rc::clone(&slot);
    server
        .get("/later", move |_req, _res| {
            let (outcome, completion) = Outcome::deferred();
            s.borrow_mut().replace(completion);
            Ok(outcome)
        })
        .unwrap();

    let exchange = engine.dispatch("GET", "/later", &[]).unwrap();
    slot.borrow_mut()
        .take()
        .unwrap()
        .reject(HandlerError::status(504, "upstream timeout"));

    assert_eq!(exchange.status(), Some(504));
    assert_eq!(exchange.body_string(), "upstream timeout");
}

#[test]
fn route_decorators_run_before_the_chain() {
    let (server, engine) = make_server();
    let log: Log = Rc::default();

    let lr = Rc::clone(&log);
    let ls = Rc::clone(&log);
    server
        .get_with(
            "/decorated",
            RouteOptions::new()
                .decorate_request(move |_req| record(&lr, "req"))
                .decorate_response(move |_res| record(&ls, "res")),
            {
                let l = Rc::clone(&log);
                move |_req, res| {
                    record(&l, "handler");
                    res.send(None);
                    Ok(Outcome::Completed)
                }
            },
        )
        .unwrap();

    engine.dispatch("GET", "/decorated", &[]).unwrap();
    assert_eq!(*log.borrow(), vec!["req", "res", "handler"]);
}
