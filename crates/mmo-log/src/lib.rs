//! Structured logging for the server and clients.
//!
//! Console output carries uptime timestamps and module paths. Debug builds can
//! additionally write JSON lines to a file for post-mortem analysis of a
//! desynchronised session. `RUST_LOG` always wins over the configured level.

use mmo_config::Config;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names a level.
/// QUIC internals are chatty at `info`.
const DEFAULT_FILTER: &str = "info,quinn=warn,quinn_proto=warn,rustls=warn";

/// File name of the JSON log inside `log_dir`.
pub const LOG_FILE_NAME: &str = "mmo.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (only used when `debug_build`)
/// * `debug_build` - enables the JSON file layer
/// * `config` - optional configuration whose `debug.log_level` sets the level
///
/// Calling this twice in one process is harmless; the second call is ignored.
///
/// ```no_run
/// use mmo_config::Config;
/// use mmo_log::init_logging;
///
/// let config = Config::default();
/// init_logging(None, false, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_for(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Filter directive string derived from the config.
///
/// An empty `debug.log_level` falls back to [`DEFAULT_FILTER`]. A bare level
/// keeps the transport crates quiet unless the user asks for them explicitly.
pub fn filter_for(config: Option<&Config>) -> String {
    match config.map(|c| c.debug.log_level.trim()) {
        Some(level) if !level.is_empty() && level.contains('=') => level.to_string(),
        Some(level) if !level.is_empty() => format!("{level},quinn=warn,quinn_proto=warn,rustls=warn"),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("quinn=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_filter_without_config() {
        assert_eq!(filter_for(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_filter_from_bare_level() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        let filter = filter_for(Some(&config));
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("rustls=warn"));
    }

    #[test]
    fn test_filter_directives_pass_through() {
        let mut config = Config::default();
        config.debug.log_level = "warn,mmo_multiplayer=trace".to_string();
        assert_eq!(filter_for(Some(&config)), "warn,mmo_multiplayer=trace");
    }

    #[test]
    fn test_empty_level_uses_default() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_for(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        for filter_str in [
            "info",
            "debug,mmo_net=trace",
            "warn,mmo_multiplayer=debug,quinn=error",
        ] {
            assert!(
                EnvFilter::try_new(filter_str).is_ok(),
                "Failed to parse filter: {filter_str}"
            );
        }
    }

    #[test]
    fn test_file_logging_creates_log_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");
        init_logging(Some(&log_dir), true, None);
        assert!(log_dir.exists());
    }
}
