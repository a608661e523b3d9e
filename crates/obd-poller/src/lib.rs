//! Battery Telemetry Polling
//!
//! Owns an ELM327 transport, runs the adapter init sequence and then polls
//! the battery ECU in a loop, publishing a status snapshot after every
//! change.

mod config;
mod engine;
mod status;

pub use config::{ObdConfig, SerialPortConfig, DEFAULT_TIMEOUT_MS, SUPPORTED_DEVICE};
pub use engine::{
    PollingEngine, ShutdownHandle, CONNECTION_STALE_AFTER, ERROR_BACKOFF, INIT_RESPONSE_TIMEOUT,
};
pub use status::{Status, StatusMessage, MAX_STATUS_MESSAGES, UNKNOWN};
