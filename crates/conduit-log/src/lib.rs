//! Structured logging for conduit services.
//!
//! Console output with uptime timestamps and module paths, filtered by the
//! configured level or `RUST_LOG`, plus an optional JSON file layer for
//! post-mortem analysis.

use std::fs::File;
use std::io;
use std::path::Path;

use conduit_config::LogConfig;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Name of the JSON log file created in the log directory.
pub const LOG_FILE_NAME: &str = "conduit.log";

const DEFAULT_FILTER: &str = "info";

/// Install the global tracing subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`. When
/// `config.json_file` is set and `log_dir` is given, records are also written
/// as JSON lines to [`LOG_FILE_NAME`]; failing to create that file only
/// disables the file layer.
///
/// Fails if a global subscriber is already installed.
///
/// ```no_run
/// use conduit_config::LogConfig;
/// use conduit_log::init_logging;
///
/// init_logging(None, &LogConfig::default()).expect("first subscriber");
/// ```
pub fn init_logging(log_dir: Option<&Path>, config: &LogConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(config));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if config.json_file
        && let Some(log_dir) = log_dir
        && let Ok(log_file) = create_log_file(log_dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();
        return subscriber.with(file_layer).try_init();
    }

    subscriber.try_init()
}

/// The filter for `config.level`, falling back to `info` when it is empty.
pub fn filter_for(config: &LogConfig) -> EnvFilter {
    if config.level.trim().is_empty() {
        return default_env_filter();
    }
    EnvFilter::try_new(&config.level).unwrap_or_else(|_| default_env_filter())
}

/// The default `info` filter.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn create_log_file(log_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    File::create(log_dir.join(LOG_FILE_NAME))
}
