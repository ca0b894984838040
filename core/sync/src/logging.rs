//! Logging setup for the sync service.

use std::env;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "FIGMA_PRESENCE_DEBUG";

/// Initializes the global subscriber. `debug` (from the CLI flag or the
/// config file) or the env switch select debug-level output; otherwise
/// `RUST_LOG` applies with an `info` fallback.
pub fn init(debug: bool) {
    let env_debug = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug || env_debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
