//! Application configuration
//!
//! Read from a TOML file (`PI_OBD_CONFIG`, default `config.toml`) layered
//! with `PI_OBD__` environment variables, e.g. `PI_OBD__SERVER__PORT=9090`.

use config::{Config, Environment, File, FileFormat};
use obd_poller::ObdConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PI_OBD_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Errors of the service layer
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid server port {0}")]
    InvalidPort(u16),
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub start: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            start: true,
            port: default_port(),
        }
    }
}

/// Log output settings; `RUST_LOG` overrides `level`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    pub obd: ObdConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Grace period for shutdown before giving up on hanging jobs
    #[serde(default = "default_shutdown_millis")]
    pub shutdown_millis: u64,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

fn default_level() -> String {
    "info".to_string()
}

fn default_shutdown_millis() -> u64 {
    500
}

impl AppConfig {
    /// Load from the file named by `PI_OBD_CONFIG`; the file must exist
    pub fn load() -> Result<Self, ApiError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let settings = Config::builder()
            .add_source(File::new(&path, FileFormat::Toml).required(true))
            .add_source(Environment::with_prefix("PI_OBD").separator("__"))
            .build()?;
        Self::from_config(settings)
    }

    /// Parse from a TOML string, without environment overrides
    pub fn from_toml(toml: &str) -> Result<Self, ApiError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::from_config(settings)
    }

    fn from_config(settings: Config) -> Result<Self, ApiError> {
        let config: AppConfig = settings.try_deserialize()?;
        if config.server.start && config.server.port == 0 {
            return Err(ApiError::InvalidPort(config.server.port));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::TransportKind;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml("[obd]\nadapter = \"sim\"\n").unwrap();
        assert_eq!(config.obd.adapter, TransportKind::Sim);
        assert_eq!(config.obd.device, "elm327");
        assert_eq!(config.obd.timeout_millis, 15_000);
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.shutdown_millis, 500);
        assert_eq!(config.log.level, "info");
        assert!(!config.log.json);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            shutdown_millis = 2000

            [obd]
            device = "elm327"
            adapter = "usb"
            timeout_millis = 5000

            [obd.serial_port]
            device = "/dev/ttyUSB0"
            baud_rate = 115200

            [server]
            start = false
            port = 9090

            [log]
            level = "debug"
            json = true
        "#;
        let config = AppConfig::from_toml(toml).unwrap();
        assert_eq!(config.obd.adapter, TransportKind::Usb);
        let port = config.obd.serial_port.as_ref().unwrap();
        assert_eq!(port.device, "/dev/ttyUSB0");
        assert_eq!(port.baud_rate, 115_200);
        assert!(!config.server.start);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.shutdown_millis, 2000);
        assert!(config.log.json);
        assert!(config.obd.validate().is_ok());
    }

    #[test]
    fn test_missing_obd_section_is_error() {
        assert!(matches!(
            AppConfig::from_toml("[server]\nport = 8080\n"),
            Err(ApiError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_adapter_is_error() {
        assert!(AppConfig::from_toml("[obd]\nadapter = \"can\"\n").is_err());
    }

    #[test]
    fn test_zero_port_is_error() {
        let toml = "[obd]\nadapter = \"sim\"\n[server]\nport = 0\n";
        assert!(matches!(
            AppConfig::from_toml(toml),
            Err(ApiError::InvalidPort(0))
        ));
    }
}
