//! Process-wide logging setup.
//!
//! Records are single lines prefixed with a UTC RFC3339 timestamp and the
//! level, written to the host's stdout sink.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::ChronoUtc;

/// Parses a configured log level; `None` for unknown values.
#[must_use]
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

/// Installs the global subscriber at the configured level.
///
/// Safe to call more than once: the host may instantiate the middleware per
/// route, and only the first installation wins. Unknown levels fall back to
/// `info` with a warning.
pub fn init(level: &str) {
    let (filter, unknown) = match parse_level(level) {
        Some(filter) => (filter, false),
        None => (LevelFilter::INFO, true),
    };

    let installed = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false)
        .try_init()
        .is_ok();

    if installed && unknown {
        tracing::warn!(level, "unknown log level, defaulting to info");
    }
}
