//! Internal diagnostics.
//!
//! User-facing output goes through each run's [`Logger`](crate::log::Logger).
//! Engine internals (stream plumbing, process handling) emit `tracing`
//! events, which a front end routes with [`init_tracing`].

use crate::log::LogLevel;
use tracing_subscriber::EnvFilter;

/// Builds the filter for engine diagnostics; `RUST_LOG` takes precedence.
#[must_use]
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("runflow={level}").into())
}

/// Installs a stderr fmt subscriber for engine diagnostics.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(level: LogLevel) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Test subscriber writing through the test harness capture. Safe to call
/// from every test; only the first call installs it.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("runflow=debug")
        .with_test_writer()
        .try_init();
}
