//! Diagnostics for the `strata` binary.
//!
//! Store activity (template builds, cache evictions, lock expiry) is logged
//! to stderr. Stdout carries only command results so `dump` and `--json`
//! output can be piped.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map the `--log-level` flag to a level. Unknown names fall back to info.
pub fn level_for(name: &str) -> Level {
    match name {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the stderr subscriber. `RUST_LOG`, when set, wins over the flag.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(log_level).as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
