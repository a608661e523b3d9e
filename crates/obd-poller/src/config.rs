//! OBD client configuration

use obd_protocol::{
    ObdError, SerialTransport, SimulatedAdapter, Transport, TransportKind, DEFAULT_BAUD_RATE,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// The only adapter model this client speaks to
pub const SUPPORTED_DEVICE: &str = "elm327";

/// Default per-response timeout for polling requests (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Serial port options for the `usb` adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// OBD client configuration, validated once before any transport opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObdConfig {
    /// Adapter model
    #[serde(default = "default_device")]
    pub device: String,
    /// Link to the adapter
    pub adapter: TransportKind,
    /// Per-response timeout for polling requests
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
    /// Required for `usb`
    #[serde(default)]
    pub serial_port: Option<SerialPortConfig>,
}

fn default_device() -> String {
    SUPPORTED_DEVICE.to_string()
}

fn default_timeout_millis() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            adapter: TransportKind::Sim,
            timeout_millis: DEFAULT_TIMEOUT_MS,
            serial_port: None,
        }
    }
}

impl ObdConfig {
    /// Simulated adapter with default timeouts
    pub fn simulated() -> Self {
        Self::default()
    }

    /// USB serial adapter on `device`
    pub fn usb(device: &str, baud_rate: u32) -> Self {
        Self {
            adapter: TransportKind::Usb,
            serial_port: Some(SerialPortConfig {
                device: device.to_string(),
                baud_rate,
            }),
            ..Self::default()
        }
    }

    /// Check every field; the first problem found is returned
    pub fn validate(&self) -> Result<(), ObdError> {
        if !self.device.eq_ignore_ascii_case(SUPPORTED_DEVICE) {
            return Err(ObdError::Config(format!(
                "device '{}' is not supported, expected '{}'",
                self.device, SUPPORTED_DEVICE
            )));
        }
        if self.timeout_millis == 0 {
            return Err(ObdError::Config("timeout_millis must be positive".to_string()));
        }
        match self.adapter {
            TransportKind::Sim => Ok(()),
            TransportKind::Usb => {
                let port = self.serial_port.as_ref().ok_or_else(|| {
                    ObdError::Config("serial_port is required for usb adapter".to_string())
                })?;
                if port.device.trim().is_empty() {
                    return Err(ObdError::Config("serial_port.device is empty".to_string()));
                }
                if port.baud_rate == 0 {
                    return Err(ObdError::Config(
                        "serial_port.baud_rate must be positive".to_string(),
                    ));
                }
                Ok(())
            }
            TransportKind::Wlan | TransportKind::Bluetooth => Err(ObdError::Unsupported(format!(
                "adapter type {}",
                self.adapter.as_str()
            ))),
        }
    }

    /// Validate and create the (not yet connected) transport
    pub fn build_transport(&self) -> Result<Box<dyn Transport>, ObdError> {
        self.validate()?;
        info!("Creating {} transport", self.adapter.as_str());
        match (self.adapter, self.serial_port.as_ref()) {
            (TransportKind::Sim, _) => Ok(Box::new(SimulatedAdapter::new())),
            (TransportKind::Usb, Some(port)) => {
                Ok(Box::new(SerialTransport::new(&port.device, port.baud_rate)?))
            }
            (kind, _) => Err(ObdError::Unsupported(format!("adapter type {}", kind.as_str()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_config_is_valid() {
        let config = ObdConfig::simulated();
        assert!(config.validate().is_ok());
        let transport = config.build_transport().unwrap();
        assert_eq!(transport.kind(), TransportKind::Sim);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_rejects_other_devices() {
        let config = ObdConfig {
            device: "stn1110".to_string(),
            ..ObdConfig::default()
        };
        assert!(matches!(config.validate(), Err(ObdError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = ObdConfig {
            timeout_millis: 0,
            ..ObdConfig::default()
        };
        assert!(matches!(config.validate(), Err(ObdError::Config(_))));
    }

    #[test]
    fn test_usb_requires_serial_port() {
        let mut config = ObdConfig::usb("/dev/ttyUSB0", 38400);
        assert!(config.validate().is_ok());
        assert_eq!(config.build_transport().unwrap().kind(), TransportKind::Usb);

        config.serial_port = None;
        assert!(matches!(config.validate(), Err(ObdError::Config(_))));
        assert!(matches!(
            ObdConfig::usb("", 38400).validate(),
            Err(ObdError::Config(_))
        ));
        assert!(matches!(
            ObdConfig::usb("/dev/ttyUSB0", 0).validate(),
            Err(ObdError::Config(_))
        ));
    }

    #[test]
    fn test_wireless_adapters_unsupported() {
        for adapter in [TransportKind::Wlan, TransportKind::Bluetooth] {
            let config = ObdConfig {
                adapter,
                ..ObdConfig::default()
            };
            assert!(matches!(config.build_transport(), Err(ObdError::Unsupported(_))));
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ObdConfig = serde_json::from_str(
            r#"{"adapter": "usb", "serial_port": {"device": "/dev/ttyUSB0"}}"#,
        )
        .unwrap();
        assert_eq!(config.device, "elm327");
        assert_eq!(config.timeout_millis, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.serial_port.unwrap().baud_rate, DEFAULT_BAUD_RATE);
    }
}
