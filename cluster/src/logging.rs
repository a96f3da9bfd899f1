//! Structured logging initialization.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedding application's choice. This helper wires up a sensible default.
//! The `RUST_LOG` environment variable takes precedence over `verbose`.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install a fmt subscriber. Safe to call more than once; later calls are
/// no-ops.
pub fn init(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
