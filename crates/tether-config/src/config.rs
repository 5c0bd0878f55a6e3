//! Configuration records with documented defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "tether.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Client connection settings.
    pub client: ClientConfig,
    /// Server settings.
    pub server: ServerConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Client connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Host the client dials.
    pub server_address: String,
    /// Port the client dials.
    pub server_port: u16,
    /// Reconnect on demand when a call finds the link down.
    pub autoconnect: bool,
    /// Reply timeout for calls without their own deadline.
    pub request_timeout_ms: u64,
    /// Bound on dialing plus handshake.
    pub dial_timeout_ms: u64,
    /// Pause between failed reconnect attempts.
    pub reconnection_interval_ms: u64,
    /// Keep-alive interval (0 = off).
    pub heartbeat_interval_ms: u64,
    /// Largest inbound frame, in bytes.
    pub buffer_size: u32,
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Allow session creation and restore.
    pub sessions_enabled: bool,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Maximum connections sharing one session (0 = unlimited).
    pub max_session_connections: usize,
    /// Idle time after which a connection is closed (0 = never).
    pub read_timeout_ms: u64,
    /// Largest inbound frame, in bytes.
    pub buffer_size: u32,
    /// Sub-protocol name advertised in the handshake.
    pub sub_protocol: Option<String>,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level; `RUST_LOG` takes precedence.
    pub log_level: String,
    /// Also write JSON lines to a file in the log directory.
    pub json_file: bool,
    /// Directory for log files. Defaults to `logs/` next to the config.
    pub log_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7070,
            autoconnect: true,
            request_timeout_ms: 60_000,
            dial_timeout_ms: 5_000,
            reconnection_interval_ms: 2_000,
            heartbeat_interval_ms: 30_000,
            buffer_size: 1_048_576,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7070,
            sessions_enabled: true,
            max_connections: 1024,
            max_session_connections: 0,
            read_timeout_ms: 60_000,
            buffer_size: 1_048_576,
            sub_protocol: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_file: false,
            log_dir: None,
        }
    }
}

impl ClientConfig {
    /// `host:port` to dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_millis(self.reconnection_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl ServerConfig {
    /// `host:port` to listen on.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Per-user config directory, e.g. `~/.config/tether` on Linux.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("tether"))
        .ok_or(ConfigError::NoConfigDir)
}

impl Config {
    /// Load `tether.ron` from `config_dir`, writing the defaults if missing.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Write `tether.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Re-read the file. `Some` only if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;
        if &new_config == self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(new_config))
    }

    /// Directory for log files: the configured one, else `logs/` under `config_dir`.
    pub fn log_dir(&self, config_dir: &Path) -> PathBuf {
        self.logging
            .log_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("logs"))
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert!(config.client.autoconnect);
        assert_eq!(config.client.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.client.reconnection_interval(), Duration::from_secs(2));
        assert_eq!(config.client.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.client.address(), "127.0.0.1:7070");
        assert_eq!(config.server.read_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let ron_str = ron::to_string(&Config::default()).unwrap();
        assert!(ron_str.contains("request_timeout_ms:60000"));
        assert!(ron_str.contains("reconnection_interval_ms:2000"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(client: (server_port: 9000))").unwrap();
        assert_eq!(config.client.server_port, 9000);
        assert_eq!(config.client.server_address, "127.0.0.1");
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_unknown_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.client.server_address = "10.0.0.1".to_string();
        config.server.sub_protocol = Some("chat".to_string());
        config.logging.json_file = true;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.client.autoconnect = false;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert!(!reloaded.client.autoconnect);
    }

    #[test]
    fn test_invalid_ron_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_log_dir_fallback() {
        let mut config = Config::default();
        assert_eq!(
            config.log_dir(Path::new("/etc/tether")),
            Path::new("/etc/tether/logs")
        );
        config.logging.log_dir = Some(PathBuf::from("/var/log/tether"));
        assert_eq!(
            config.log_dir(Path::new("/etc/tether")),
            Path::new("/var/log/tether")
        );
    }
}
