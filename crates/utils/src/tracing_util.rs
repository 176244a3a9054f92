use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Output goes to stderr; the
/// level defaults to `warn` and is overridden via `RUST_LOG`.
pub fn initialize_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .compact();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}
