//! Tracing subscriber setup for binaries and tests

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging for the process.
///
/// The filter is taken from `RUST_LOG` when set, otherwise `runbridge=info`.
/// Safe to call once per process; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runbridge=info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Initialize verbose logging for tests.
///
/// Keeps output on stderr so test harness capture works as usual.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("runbridge=debug"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
