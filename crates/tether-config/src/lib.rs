//! Configuration for tether clients and servers.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line. Durations are stored as whole milliseconds.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{ClientConfig, Config, LoggingConfig, ServerConfig, default_config_dir};
pub use error::ConfigError;
