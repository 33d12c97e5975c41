//! Tracing-based logging setup.
//!
//! No module in this workspace reaches for `println!`/`eprintln!` for
//! anything but the binary crate's final summary line; everything else goes
//! through `tracing`'s leveled, structured events.

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LoggingConfig;

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the global tracing subscriber from configuration.
///
/// Installs a compact, ANSI-colored formatter by default, or a JSON
/// formatter when `config.json` is set (for shipping logs to a collector).
/// Calling this more than once per process will panic, matching
/// `tracing_subscriber`'s own global-default behavior.
pub fn init(config: &LoggingConfig) {
    let level = std::env::var("BULKMAIL_LOG")
        .ok()
        .map_or_else(|| parse_level(&config.level), |v| parse_level(&v));

    let target_filter = FilterFn::new(|metadata| metadata.target().starts_with("bulkmail"));

    if config.json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_filter(level)
                    .with_filter(target_filter),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
                    .compact()
                    .with_ansi(true)
                    .with_filter(level)
                    .with_filter(target_filter),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_known_names() {
        assert_eq!(parse_level("debug"), LevelFilter::DEBUG);
        assert_eq!(parse_level("WARN"), LevelFilter::WARN);
        assert_eq!(parse_level("nonsense"), LevelFilter::INFO);
    }
}
