pub mod mock_engine;

#[allow(unused_imports)]
pub use mock_engine::{MockEngine, MockExchange};

use expresslane::{Server, ServerConfig};

/// Standard harness: a server wired to a shared mock engine handle.
#[allow(dead_code)]
pub fn make_server() -> (Server, MockEngine) {
    make_server_with(ServerConfig::default())
}

#[allow(dead_code)]
pub fn make_server_with(config: ServerConfig) -> (Server, MockEngine) {
    let engine = MockEngine::new();
    let server = Server::new(Box::new(engine.clone()), config);
    (server, engine)
}
