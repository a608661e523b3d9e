//! Transport Capability Set

use crate::correlator::ResponseCorrelator;
use crate::error::ObdError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of byte-stream link to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process simulated adapter
    Sim,
    /// USB serial port
    Usb,
    /// WLAN adapter (not supported)
    Wlan,
    /// Bluetooth adapter (not supported)
    Bluetooth,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Sim => "sim",
            TransportKind::Usb => "usb",
            TransportKind::Wlan => "wlan",
            TransportKind::Bluetooth => "bluetooth",
        }
    }
}

/// A byte stream to an ELM327 adapter
///
/// Inbound bytes are delivered to the transport's [`ResponseCorrelator`],
/// which callers use to await complete responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link
    async fn connect(&mut self) -> Result<(), ObdError>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<(), ObdError>;

    /// Whether the link is open
    fn is_open(&self) -> bool;

    /// Write raw bytes to the adapter
    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError>;

    /// Receive side of this transport
    fn correlator(&self) -> &ResponseCorrelator;

    /// Which kind of link this is
    fn kind(&self) -> TransportKind;
}
