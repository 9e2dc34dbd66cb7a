//! Tracing subscriber setup
//!
//! The library itself only emits `tracing` events. Binaries and test
//! harnesses call [`init_tracing`] once; later calls are no-ops.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSettings;

/// Install a stderr fmt subscriber filtered by `RUST_LOG`, falling back to
/// `settings.level`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(settings: &LoggingSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(settings.ansi)
        .with_target(true)
        .try_init()
        .is_ok()
}
