//! Diagnostic tracing for the binary.
//!
//! Tracing goes to stderr and is not persisted. The product audit trail is
//! each run's `events.jsonl`, which is written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CONDUCTOR_LOG";

/// Filter from `CONDUCTOR_LOG`, then `RUST_LOG`, then the default level.
pub fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "warn" };
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. `json` switches to one JSON object per line.
pub fn init(verbose: bool, json: bool) {
    let registry = tracing_subscriber::registry().with(filter(verbose));
    let result = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
    // A subscriber may already be installed (tests, embedding).
    let _ = result;
}
