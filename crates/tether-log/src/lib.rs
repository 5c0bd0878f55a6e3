//! Structured logging for tether binaries.
//!
//! Console output is human-readable with uptime timestamps. An optional
//! JSON-lines file can be written next to the config for later inspection.
//! `RUST_LOG` always wins over the configured level.

use std::fs::File;
use std::path::Path;

use tether_config::Config;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Name of the JSON log file inside the log directory.
pub const LOG_FILE: &str = "tether.log";

const DEFAULT_DIRECTIVES: &str = "info";

/// Install the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file
/// * `json_file` - write the JSON file in addition to the console
/// * `config` - source of the default level when `RUST_LOG` is unset
///
/// Fails if a global subscriber is already installed. A log directory that
/// cannot be created only disables the file layer.
///
/// ```no_run
/// use tether_config::Config;
/// use tether_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config)).ok();
/// ```
pub fn init_logging(
    log_dir: Option<&Path>,
    json_file: bool,
    config: Option<&Config>,
) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir.filter(|_| json_file).and_then(open_log_file) {
        Some(log_file) => {
            let file_layer = fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::uptime())
                .json();
            subscriber.with(file_layer).try_init()
        }
        None => subscriber.try_init(),
    }
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_DIRECTIVES)
}

/// Filter directives derived from the configured level.
pub fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.logging.log_level.trim().is_empty() => {
            config.logging.log_level.trim().to_string()
        }
        _ => DEFAULT_DIRECTIVES.to_string(),
    }
}

fn open_log_file(log_dir: &Path) -> Option<File> {
    std::fs::create_dir_all(log_dir).ok()?;
    File::create(log_dir.join(LOG_FILE)).ok()
}
