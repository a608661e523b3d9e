//! Polling Engine
//!
//! Drives the adapter: runs the AT init sequence once, then polls the
//! battery ECU forever. Every per-command failure ends up as a short status
//! message; nothing short of a stop request ends the loop.

use crate::config::ObdConfig;
use crate::status::{Status, UNKNOWN};
use chrono::Local;
use obd_protocol::frame::{self, soc_display};
use obd_protocol::{
    escape_wire, AtCommand, Command, DataRequest, ObdError, ResponseCorrelator, Transport,
    BATTERY_ECU_HEADER,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timeout for each init command
pub const INIT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Without a response for this long the adapter counts as disconnected
pub const CONNECTION_STALE_AFTER: Duration = Duration::from_secs(30);

/// Pause after an unexpected failure in a polling iteration
pub const ERROR_BACKOFF: Duration = Duration::from_millis(1000);

/// Cooperative stop flag shared with whoever drives shutdown
///
/// The engine checks it between commands and before backing off; a read
/// already in flight runs to completion or timeout first unless
/// [`ShutdownHandle::cancel_pending_read`] cuts it short.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    correlator: ResponseCorrelator,
}

impl ShutdownHandle {
    fn new(correlator: ResponseCorrelator) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            correlator,
        }
    }

    /// Ask the engine to stop at its next check point
    pub fn request_stop(&self) {
        info!("Stop requested for polling engine");
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Abandon the read the engine is waiting on
    ///
    /// The engine records nothing for a read cancelled after a stop request.
    pub fn cancel_pending_read(&self) {
        let partial = self.correlator.clear_and_return_buffered();
        info!("Pending read cancelled, discarded: {}", escape_wire(&partial));
    }
}

fn local_time() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn stamped(value: &str) -> String {
    format!("{} ({})", value, local_time())
}

/// Polling state machine owning the transport and the status snapshot
pub struct PollingEngine {
    transport: Box<dyn Transport>,
    /// Per-response timeout for polling requests
    response_timeout: Duration,
    status: Status,
    status_tx: watch::Sender<Status>,
    shutdown: ShutdownHandle,
    last_response_at: Instant,
}

impl PollingEngine {
    /// Create an engine over an unconnected transport
    pub fn new(transport: Box<dyn Transport>, response_timeout: Duration) -> Self {
        let status = Status::new();
        let (status_tx, _) = watch::channel(status.clone());
        let shutdown = ShutdownHandle::new(transport.correlator().clone());
        Self {
            transport,
            response_timeout,
            status,
            status_tx,
            shutdown,
            last_response_at: Instant::now(),
        }
    }

    /// Validate `config` and create an engine with the matching transport
    pub fn from_config(config: &ObdConfig) -> Result<Self, ObdError> {
        let transport = config.build_transport()?;
        Ok(Self::new(
            transport,
            Duration::from_millis(config.timeout_millis),
        ))
    }

    /// Open the transport and mark the adapter connected
    pub async fn connect(&mut self) -> Result<(), ObdError> {
        self.transport.connect().await?;
        self.status.set_connected(true);
        self.status.set_adapter_type(self.transport.kind());
        self.publish();
        info!("Connected to {} adapter", self.transport.kind().as_str());
        Ok(())
    }

    /// Receiver of status snapshots, updated after every change
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn is_transport_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Stop the loop and close the transport if open
    pub async fn shutdown(&mut self) -> Result<(), ObdError> {
        self.shutdown.request_stop();
        if self.transport.is_open() {
            self.transport.disconnect().await?;
        }
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.is_stop_requested()
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn add_status_message(&mut self, message: String) {
        debug!("Status message: {}", message);
        self.status.push_message(message);
        self.publish();
    }

    /// Run the init sequence, then poll until a stop is requested
    pub async fn run(&mut self) -> Result<(), ObdError> {
        if self.stop_requested() {
            return Err(ObdError::Cancelled);
        }
        self.initialize().await;
        self.last_response_at = Instant::now();
        info!("Starting battery polling loop");

        loop {
            if self.stop_requested() {
                info!("Polling loop stopped");
                return Ok(());
            }
            if let Err(e) = self.poll_once().await {
                warn!("Polling iteration failed: {}", e);
                self.add_status_message("Error 2".to_string());
                self.status.set_battery_unknown();
                self.publish();
                if self.stop_requested() {
                    continue;
                }
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    /// Send the AT init sequence; failures are logged and skipped
    async fn initialize(&mut self) {
        for at in AtCommand::INIT_SEQUENCE {
            if self.stop_requested() {
                return;
            }
            let command = Command::from(at);
            if let Err(e) = self.send(command).await {
                warn!("Init command {} not sent: {}", command.label(), e);
                continue;
            }
            match self.await_response(INIT_RESPONSE_TIMEOUT).await {
                Ok(response) if at == AtCommand::ReadVoltage => {
                    info!("Adapter supply voltage: {}", response.trim_end_matches('>').trim());
                }
                Ok(response) => {
                    debug!("{} -> {}", command.label(), escape_wire(&response));
                }
                Err(e) => warn!("Init command {}: {}", command.label(), e),
            }
        }
    }

    /// One pass over all polled requests
    async fn poll_once(&mut self) -> Result<(), ObdError> {
        self.status.evict_overflow();
        self.status.set_last_refresh(local_time());
        self.status
            .set_connected(self.last_response_at.elapsed() < CONNECTION_STALE_AFTER);
        self.publish();

        if self.stop_requested() {
            return Ok(());
        }
        self.poll_general_status().await?;

        if self.stop_requested() {
            return Ok(());
        }
        self.poll_battery().await?;

        if self.stop_requested() {
            return Ok(());
        }
        self.poll_state_of_charge().await
    }

    /// Liveness check; only verifies that the battery ECU answers
    async fn poll_general_status(&mut self) -> Result<(), ObdError> {
        let request = DataRequest::GeneralStatus;
        self.send(request.into()).await?;
        match self.await_response(self.response_timeout).await {
            Ok(response) => {
                if frame::matches_header(&response, BATTERY_ECU_HEADER) {
                    debug!("Response for {}: {}", request.code(), escape_wire(&response));
                } else {
                    warn!("Invalid response for {}: {}", request.code(), escape_wire(&response));
                    self.add_status_message(format!("{}: Err1", request.code()));
                }
                self.last_response_at = Instant::now();
            }
            Err(e) => self.record_incomplete(request, &e),
        }
        Ok(())
    }

    /// Battery current and voltage from extended page 1
    async fn poll_battery(&mut self) -> Result<(), ObdError> {
        let request = DataRequest::ExtendedPage1;
        self.send(request.into()).await?;
        match self.await_response(self.response_timeout).await {
            Ok(response) => {
                match frame::decode_battery(&response, BATTERY_ECU_HEADER) {
                    Ok(raw) => {
                        let current = raw.current_display().map(|c| stamped(&c));
                        let voltage = raw.voltage_display().map(|v| stamped(&v));
                        info!(
                            "Current: {}, Voltage: {}",
                            current.as_deref().unwrap_or(UNKNOWN),
                            voltage.as_deref().unwrap_or(UNKNOWN)
                        );
                        self.status.set_current(current.unwrap_or_else(|| UNKNOWN.to_string()));
                        self.status.set_voltage(voltage.unwrap_or_else(|| UNKNOWN.to_string()));
                        self.publish();
                    }
                    Err(e) => {
                        warn!(
                            "Invalid response for {} ({}): {}",
                            request.code(),
                            e,
                            escape_wire(&response)
                        );
                        self.add_status_message(format!("{}: Err1", request.code()));
                    }
                }
                self.last_response_at = Instant::now();
            }
            Err(e) => {
                self.record_incomplete(request, &e);
                self.status.set_battery_unknown();
                self.publish();
            }
        }
        Ok(())
    }

    /// State of charge from extended page 2; a failure keeps the last value
    async fn poll_state_of_charge(&mut self) -> Result<(), ObdError> {
        let request = DataRequest::ExtendedPage2;
        self.send(request.into()).await?;
        match self.await_response(self.response_timeout).await {
            Ok(response) => {
                match frame::decode_soc(&response, BATTERY_ECU_HEADER) {
                    Ok(Some(percent)) => {
                        let soc = soc_display(percent);
                        info!("SOC: {}", soc);
                        self.status.set_soc(stamped(&soc));
                        self.publish();
                    }
                    Ok(None) | Err(_) => {
                        warn!(
                            "No SOC frame in response for {}: {}",
                            request.code(),
                            escape_wire(&response)
                        );
                        self.add_status_message(format!("{}: Err1", request.code()));
                    }
                }
                self.last_response_at = Instant::now();
            }
            Err(e) => self.record_incomplete(request, &e),
        }
        Ok(())
    }

    /// Drop stale input, then write `command`
    async fn send(&mut self, command: Command) -> Result<(), ObdError> {
        let stale = self.transport.correlator().clear_and_return_buffered();
        if !stale.is_empty() {
            debug!("Discarding stale input: {}", escape_wire(&stale));
        }
        debug!("Sending {}", command.label());
        self.transport.write(&command.to_wire()).await
    }

    async fn await_response(&self, timeout: Duration) -> Result<String, ObdError> {
        self.transport.correlator().await_next_response(timeout).await
    }

    fn record_incomplete(&mut self, request: DataRequest, error: &ObdError) {
        if *error == ObdError::Cancelled && self.stop_requested() {
            debug!("Read for {} abandoned on stop", request.code());
            return;
        }
        let partial = self.transport.correlator().clear_and_return_buffered();
        warn!(
            "Incomplete response for {} ({}): {}",
            request.code(),
            error,
            escape_wire(&partial)
        );
        self.add_status_message(format!("{}: Err2", request.code()));
    }
}
