//! Command-line overrides shared by tether binaries.

use std::path::PathBuf;

use clap::Args;

use crate::Config;

/// Options common to every tether command.
///
/// Values given here override settings loaded from `tether.ron`.
#[derive(Args, Debug, Default, Clone)]
pub struct CliArgs {
    /// Server address (client target and server bind address).
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Server port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Reconnect on demand when the link is down.
    #[arg(long, global = true)]
    pub autoconnect: Option<bool>,

    /// Default request timeout in milliseconds.
    #[arg(long, global = true)]
    pub request_timeout_ms: Option<u64>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.address {
            self.client.server_address = addr.clone();
            self.server.bind_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.client.server_port = port;
            self.server.port = port;
        }
        if let Some(ref level) = args.log_level {
            self.logging.log_level = level.clone();
        }
        if let Some(autoconnect) = args.autoconnect {
            self.client.autoconnect = autoconnect;
        }
        if let Some(ms) = args.request_timeout_ms {
            self.client.request_timeout_ms = ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            address: Some("0.0.0.0".to_string()),
            port: Some(9100),
            autoconnect: Some(false),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.client.server_address, "0.0.0.0");
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.client.server_port, 9100);
        assert_eq!(config.server.port, 9100);
        assert!(!config.client.autoconnect);
        // Non-overridden fields retain defaults
        assert_eq!(config.client.request_timeout_ms, 60_000);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: CliArgs,
        }

        let parsed = Wrapper::parse_from([
            "tether",
            "--port",
            "8000",
            "--log-level",
            "debug",
            "--request-timeout-ms",
            "250",
        ]);
        assert_eq!(parsed.args.port, Some(8000));
        assert_eq!(parsed.args.log_level.as_deref(), Some("debug"));
        assert_eq!(parsed.args.request_timeout_ms, Some(250));
        assert!(parsed.args.address.is_none());
    }
}
