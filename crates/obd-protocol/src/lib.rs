//! OBD-II Protocol Implementation
//!
//! This crate provides async communication with ELM327-compatible adapters:
//! a transport abstraction with a serial and a simulated implementation, the
//! correlator that cuts the inbound byte stream into responses, and the
//! decoder for the battery ECU's multi-frame replies.

mod correlator;
mod error;
pub mod frame;
mod protocol;
mod serial;
mod sim;
mod transport;

pub use correlator::ResponseCorrelator;
pub use error::ObdError;
pub use frame::{BatteryRaw, Frame};
pub use protocol::{escape_wire, AtCommand, Command, DataRequest, BATTERY_ECU_HEADER, TERMINATOR};
pub use serial::{SerialTransport, DEFAULT_BAUD_RATE};
pub use sim::{AdapterMode, SimulatedAdapter, SEARCH_LATENCY};
pub use transport::{Transport, TransportKind};
