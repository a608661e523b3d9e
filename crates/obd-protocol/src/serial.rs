//! Serial Port Transport
//!
//! Talks to a physical ELM327 adapter over a USB serial device.

use crate::correlator::ResponseCorrelator;
use crate::error::ObdError;
use crate::transport::{Transport, TransportKind};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Default ELM327 baud rate
pub const DEFAULT_BAUD_RATE: u32 = 38400;

const READ_CHUNK: usize = 256;

/// Transport backed by a serial device such as `/dev/ttyUSB0`
pub struct SerialTransport {
    /// Serial port device path
    device: String,
    /// Baud rate for serial communication
    baud_rate: u32,
    writer: Option<WriteHalf<SerialStream>>,
    reader_task: Option<JoinHandle<()>>,
    correlator: ResponseCorrelator,
}

impl SerialTransport {
    /// Create a transport for `device`, validating the port options
    pub fn new(device: &str, baud_rate: u32) -> Result<Self, ObdError> {
        if device.trim().is_empty() {
            return Err(ObdError::Config("serial device path is empty".to_string()));
        }
        if baud_rate == 0 {
            return Err(ObdError::Config("baud rate must be positive".to_string()));
        }
        info!("Creating serial transport for device: {}", device);
        Ok(Self {
            device: device.to_string(),
            baud_rate,
            writer: None,
            reader_task: None,
            correlator: ResponseCorrelator::new(),
        })
    }

    /// Device path this transport opens
    pub fn device(&self) -> &str {
        &self.device
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<(), ObdError> {
        if self.writer.is_some() {
            return Err(ObdError::AlreadyOpen);
        }
        let port = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        info!("Serial port {} opened at {} baud", self.device, self.baud_rate);

        let (mut reader, writer) = tokio::io::split(port);
        let correlator = self.correlator.clone();
        let device = self.device.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        warn!("Serial port {} reached end of stream", device);
                        break;
                    }
                    Ok(n) => correlator.on_bytes_delivered(&buf[..n]),
                    Err(e) => {
                        warn!("Serial port {} read error: {}", device, e);
                        break;
                    }
                }
            }
        }));
        self.writer = Some(writer);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ObdError> {
        let Some(mut writer) = self.writer.take() else {
            return Err(ObdError::NotOpen);
        };
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        let result = writer.shutdown().await;
        info!("Serial port {} closed", self.device);
        result.map_err(ObdError::from)
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let writer = self.writer.as_mut().ok_or(ObdError::NotOpen)?;
        debug!("Serial write: {:?}", String::from_utf8_lossy(data));
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }
}
