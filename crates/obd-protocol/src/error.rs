//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// No response terminator arrived in time
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// A pending read was superseded or explicitly cleared
    #[error("Pending read cancelled")]
    Cancelled,

    /// Response received but the expected frame is missing
    #[error("Expected frame not found: {0}")]
    DecodeMismatch(String),

    /// Underlying connect/write/disconnect failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation requires an open transport
    #[error("Transport not open")]
    NotOpen,

    /// Transport was already open
    #[error("Transport already open")]
    AlreadyOpen,

    /// Invalid construction parameters
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Adapter or transport kind not supported
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}
