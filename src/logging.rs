//! Tracing subscriber bootstrap.
//!
//! Applications embed the crate and usually own their own subscriber; this
//! helper exists for binaries and examples that just want structured logs
//! honoring `RUST_LOG`.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global fmt subscriber with env-filter support.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
