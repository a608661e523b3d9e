//! Status snapshot published by the polling engine

use chrono::{DateTime, Utc};
use obd_protocol::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of recent messages kept
pub const MAX_STATUS_MESSAGES: usize = 3;

/// Placeholder for a value that could not be read
pub const UNKNOWN: &str = "?";

/// A short event note, e.g. `2101: Err2`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Connection state, latest readings and recent error codes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_refresh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    adapter_type: Option<TransportKind>,
    recent_messages: VecDeque<StatusMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    soc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voltage: Option<String>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn last_refresh(&self) -> Option<&str> {
        self.last_refresh.as_deref()
    }

    pub fn adapter_type(&self) -> Option<TransportKind> {
        self.adapter_type
    }

    pub fn soc(&self) -> Option<&str> {
        self.soc.as_deref()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn voltage(&self) -> Option<&str> {
        self.voltage.as_deref()
    }

    /// Recent messages, oldest first
    pub fn recent_messages(&self) -> impl Iterator<Item = &StatusMessage> {
        self.recent_messages.iter()
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn set_adapter_type(&mut self, kind: TransportKind) {
        self.adapter_type = Some(kind);
    }

    pub fn set_last_refresh(&mut self, at: impl Into<String>) {
        self.last_refresh = Some(at.into());
    }

    pub fn set_soc(&mut self, soc: impl Into<String>) {
        self.soc = Some(soc.into());
    }

    pub fn set_current(&mut self, current: impl Into<String>) {
        self.current = Some(current.into());
    }

    pub fn set_voltage(&mut self, voltage: impl Into<String>) {
        self.voltage = Some(voltage.into());
    }

    /// Mark current and voltage as unreadable
    pub fn set_battery_unknown(&mut self) {
        self.set_current(UNKNOWN);
        self.set_voltage(UNKNOWN);
    }

    /// Append a message, evicting the oldest beyond the cap
    pub fn push_message(&mut self, message: impl Into<String>) {
        self.recent_messages.push_back(StatusMessage {
            at: Utc::now(),
            message: message.into(),
        });
        self.evict_overflow();
    }

    /// Drop the oldest messages while more than the cap are held
    pub fn evict_overflow(&mut self) {
        while self.recent_messages.len() > MAX_STATUS_MESSAGES {
            self.recent_messages.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(status: &Status) -> Vec<&str> {
        status.recent_messages().map(|m| m.message.as_str()).collect()
    }

    #[test]
    fn test_message_ring_evicts_oldest() {
        let mut status = Status::new();
        for msg in ["0100: Err1", "2101: Err2", "2105: Err1"] {
            status.push_message(msg);
        }
        assert_eq!(messages(&status), ["0100: Err1", "2101: Err2", "2105: Err1"]);

        status.push_message("Error 2");
        assert_eq!(messages(&status), ["2101: Err2", "2105: Err1", "Error 2"]);
    }

    #[test]
    fn test_battery_unknown() {
        let mut status = Status::new();
        status.set_current("14.2A (10:00:00)");
        status.set_battery_unknown();
        assert_eq!(status.current(), Some(UNKNOWN));
        assert_eq!(status.voltage(), Some(UNKNOWN));
        assert_eq!(status.soc(), None);
    }

    #[test]
    fn test_serialized_shape() {
        let mut status = Status::new();
        status.set_connected(true);
        status.set_adapter_type(TransportKind::Sim);
        status.set_last_refresh("12:30:01");
        status.set_soc("50% (12:30:01)");
        status.push_message("2105: Err1");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connected"], true);
        assert_eq!(json["adapterType"], "sim");
        assert_eq!(json["lastRefresh"], "12:30:01");
        assert_eq!(json["soc"], "50% (12:30:01)");
        assert_eq!(json["recentMessages"][0]["message"], "2105: Err1");
        assert!(json.get("current").is_none());
    }
}
