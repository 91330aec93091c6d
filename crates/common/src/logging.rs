//! Logging bootstrap
//!
//! Installs a stderr `tracing` subscriber. `RUST_LOG` takes precedence over
//! the verbosity count.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter directive for a number of `-v` flags
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Install the global subscriber; later calls are ignored
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Like [`init`], emitting one JSON object per event
pub fn init_json(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
