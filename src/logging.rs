use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Writes to stderr only, since process workers answer the host on stdout.
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    init_logging_with("info");
}

/// Same as [`init_logging`] with a different fallback directive
pub fn init_logging_with(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
