//! ELM327 Command Vocabulary


/// End-of-response marker sent by the adapter (carriage return + prompt)
pub const TERMINATOR: &[u8] = b"\r>";

/// Arbitration id of the battery management ECU
pub const BATTERY_ECU_HEADER: &str = "7EC";

/// Adapter configuration commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommand {
    /// Restore adapter defaults
    Defaults,
    /// Full adapter reset
    Reset,
    /// Echo off
    EchoOff,
    /// Spaces between bytes off
    SpacesOff,
    /// Show arbitration ids in responses
    HeadersOn,
    /// Read adapter supply voltage
    ReadVoltage,
}

impl AtCommand {
    /// Commands sent once before polling starts, in order
    pub const INIT_SEQUENCE: [AtCommand; 6] = [
        AtCommand::Defaults,
        AtCommand::Reset,
        AtCommand::EchoOff,
        AtCommand::SpacesOff,
        AtCommand::HeadersOn,
        AtCommand::ReadVoltage,
    ];

    /// Text after the `AT` prefix
    pub fn mnemonic(&self) -> &'static str {
        match self {
            AtCommand::Defaults => "D",
            AtCommand::Reset => "Z",
            AtCommand::EchoOff => "E0",
            AtCommand::SpacesOff => "S0",
            AtCommand::HeadersOn => "H1",
            AtCommand::ReadVoltage => "RV",
        }
    }
}

/// Mode + PID data requests polled from the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRequest {
    /// Supported PIDs 01-20, used as a liveness check
    GeneralStatus,
    /// Extended data page 1: battery current and voltage
    ExtendedPage1,
    /// Extended data page 2: state of charge
    ExtendedPage2,
}

impl DataRequest {
    /// The 4-hex-digit request code
    pub fn code(&self) -> &'static str {
        match self {
            DataRequest::GeneralStatus => "0100",
            DataRequest::ExtendedPage1 => "2101",
            DataRequest::ExtendedPage2 => "2105",
        }
    }
}

/// An outbound instruction, not retained after send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    At(AtCommand),
    Data(DataRequest),
}

impl Command {
    /// Human readable form used in logs and status messages
    pub fn label(&self) -> String {
        match self {
            Command::At(at) => format!("AT {}", at.mnemonic()),
            Command::Data(req) => req.code().to_string(),
        }
    }

    /// Bytes as written to the adapter, CR LF terminated
    pub fn to_wire(&self) -> Vec<u8> {
        format!("{}\r\n", self.label()).into_bytes()
    }
}

impl From<AtCommand> for Command {
    fn from(cmd: AtCommand) -> Self {
        Command::At(cmd)
    }
}

impl From<DataRequest> for Command {
    fn from(req: DataRequest) -> Self {
        Command::Data(req)
    }
}

/// Escape CR and LF so raw adapter traffic fits on one log line
pub fn escape_wire(text: &str) -> String {
    text.replace('\r', "\\r").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_wire_format() {
        assert_eq!(Command::from(AtCommand::EchoOff).to_wire(), b"AT E0\r\n");
        assert_eq!(Command::from(AtCommand::ReadVoltage).label(), "AT RV");
    }

    #[test]
    fn test_data_request_wire_format() {
        assert_eq!(Command::from(DataRequest::ExtendedPage1).to_wire(), b"2101\r\n");
        assert_eq!(Command::from(DataRequest::GeneralStatus).label(), "0100");
    }

    #[test]
    fn test_escape_wire() {
        assert_eq!(escape_wire("7EC\r\n>"), "7EC\\r\\n>");
    }
}
