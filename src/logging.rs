//! Logging setup on top of `tracing`
//!
//! `RUST_LOG` takes a full filter directive; `FLOWBOX_LOG_LEVEL` takes a
//! plain level. Without either, `info` is used.

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

const LOG_LEVEL_ENV: &str = "FLOWBOX_LOG_LEVEL";

fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .map(|level| level.trim().to_lowercase())
        .filter(|level| matches!(level.as_str(), "error" | "warn" | "info" | "debug" | "trace"))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    EnvFilter::new(level)
}

/// Installs the global subscriber; later calls are no-ops
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init();
}

/// Subscriber writing through the test harness capture, for use in tests
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}
