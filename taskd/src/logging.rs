//! Operational tracing for the worker.
//!
//! All diagnostics go to stderr through `tracing`. Records themselves are the
//! durable product output; nothing here is persisted.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` so each tick's transitions are visible.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=taskd=debug taskd run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
