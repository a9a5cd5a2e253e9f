mod common;

use std::fs;

use common::make_server;
use expresslane::{static_files, Outcome, StaticFiles};
use tempfile::TempDir;

/// A server with a static mount under `/files` and a 404 fall-through route.
fn static_server(sf: StaticFiles) -> (expresslane::Server, common::MockEngine) {
    let (server, engine) = make_server();
    server
        .use_middleware("/", sf.into_middleware())
        .unwrap();
    server
        .any("/*", |_req, res| {
            res.status(404)?;
            res.send(Some(b"not found"));
            Ok(Outcome::Completed)
        })
        .unwrap();
    (server, engine)
}

fn fixture() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("index.html"), "<html>home</html>").unwrap();
    fs::create_dir(dir.path().join("css")).unwrap();
    fs::write(dir.path().join("css/site.css"), "body { margin: 0 }").unwrap();
    dir
}

#[test]
fn serves_files_with_mime_type_and_etag() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let exchange = engine.dispatch("GET", "/files/css/site.css", &[]).unwrap();
    assert_eq!(exchange.status(), Some(200));
    assert_eq!(exchange.body_string(), "body { margin: 0 }");
    assert_eq!(
        exchange.response_header("content-type").as_deref(),
        Some("text/css")
    );
    let etag = exchange.response_header("etag").unwrap();
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(exchange.declared_total_size(), Some(18));
}

#[test]
fn directory_paths_serve_the_index_file() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let exchange = engine.dispatch("GET", "/files", &[]).unwrap();
    assert_eq!(exchange.body_string(), "<html>home</html>");
    assert_eq!(
        exchange.response_header("content-type").as_deref(),
        Some("text/html")
    );
}

#[test]
fn missing_files_fall_through_to_the_next_stage() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let exchange = engine.dispatch("GET", "/files/no/such.txt", &[]).unwrap();
    assert_eq!(exchange.status(), Some(404));
    assert_eq!(exchange.body_string(), "not found");
}

#[test]
fn non_read_methods_get_405_with_allow() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let exchange = engine
        .dispatch("POST", "/files/css/site.css", &[])
        .unwrap();
    assert_eq!(exchange.status(), Some(405));
    assert_eq!(exchange.response_header("allow").as_deref(), Some("GET, HEAD"));
}

#[test]
fn traversal_components_never_reach_the_filesystem() {
    let dir = fixture();
    // A real file one level above the served root.
    let outside = dir.path().join("secret.txt");
    fs::write(&outside, "secret").unwrap();
    let root = dir.path().join("css");
    let sf = StaticFiles::new(&root).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let exchange = engine
        .dispatch("GET", "/files/../secret.txt", &[])
        .unwrap();
    assert_eq!(exchange.status(), Some(404));
}

#[test]
fn matching_if_none_match_revalidates_with_304() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let first = engine.dispatch("GET", "/files/css/site.css", &[]).unwrap();
    let etag = first.response_header("etag").unwrap();

    let second = engine
        .dispatch("GET", "/files/css/site.css", &[("if-none-match", &etag)])
        .unwrap();
    assert_eq!(second.status(), Some(304));
    assert!(second.body_bytes().is_empty());
    assert_eq!(second.response_header("etag"), Some(etag));

    // A stale validator still gets the full body.
    let third = engine
        .dispatch("GET", "/files/css/site.css", &[("if-none-match", "\"0-0\"")])
        .unwrap();
    assert_eq!(third.status(), Some(200));
    assert_eq!(third.body_string(), "body { margin: 0 }");
}

#[test]
fn head_requests_report_length_without_a_body() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files");
    let (_server, engine) = static_server(sf);

    let exchange = engine.dispatch("HEAD", "/files/css/site.css", &[]).unwrap();
    assert_eq!(exchange.status(), Some(200));
    assert_eq!(
        exchange.response_header("content-length").as_deref(),
        Some("18")
    );
    assert!(exchange.body_bytes().is_empty());
    assert!(exchange.ended_without_body());
}

#[test]
fn cache_pool_entries_can_be_expired() {
    let dir = fixture();
    let path = dir.path().join("css/site.css");
    let sf = StaticFiles::new(dir.path()).mounted_at("/files").cached(None);
    let (_server, engine) = static_server(sf);

    // Nothing pooled before the first hit.
    assert!(!static_files::expire(&path));

    engine.dispatch("GET", "/files/css/site.css", &[]).unwrap();
    assert!(static_files::expire(&path));
    assert!(!static_files::expire(&path));

    // A second hit repopulates; a pool clear empties it again.
    engine.dispatch("GET", "/files/css/site.css", &[]).unwrap();
    static_files::clear_pool();
    assert!(!static_files::expire(&path));
}

#[test]
fn cached_serving_returns_identical_bytes() {
    let dir = fixture();
    let sf = StaticFiles::new(dir.path()).mounted_at("/files").cached(None);
    let (_server, engine) = static_server(sf);

    let first = engine.dispatch("GET", "/files/index.html", &[]).unwrap();
    let second = engine.dispatch("GET", "/files/index.html", &[]).unwrap();
    assert_eq!(first.body_string(), second.body_string());
    assert_eq!(
        first.response_header("etag"),
        second.response_header("etag")
    );
}
