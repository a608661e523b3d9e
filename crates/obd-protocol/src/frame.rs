//! Frame Decoding
//!
//! Decodes the multi-line hexadecimal replies of the battery ECU. Each line
//! starts with a 3-digit arbitration id; multi-frame payloads follow it with
//! a 2-digit frame tag (`21`, `22`, ...) and then hex payload bytes. Values
//! are read at fixed character offsets of the line.

use crate::error::ObdError;

/// Offsets of the current high byte in frame `21`
const CURRENT_HIGH: (usize, usize) = (17, 19);
/// Offsets of the current low byte in frame `22`
const CURRENT_LOW: (usize, usize) = (5, 7);
/// Offsets of the 16-bit voltage in frame `22`
const VOLTAGE_RAW: (usize, usize) = (7, 11);
/// Offsets of the state-of-charge byte in frame `24`
const SOC_RAW: (usize, usize) = (17, 19);

/// One line of a response split into arbitration id and payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Hex arbitration id, e.g. `7EC`
    pub header_id: &'a str,
    /// Everything after the id
    pub payload_hex: &'a str,
}

impl<'a> Frame<'a> {
    /// Split a line after its 3-character arbitration id
    pub fn parse(line: &'a str) -> Option<Self> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return None;
        }
        let (header_id, payload_hex) = line.split_at(3);
        header_id
            .chars()
            .all(|c| c.is_ascii_hexdigit())
            .then_some(Frame {
                header_id,
                payload_hex,
            })
    }
}

/// Raw battery current and voltage components
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatteryRaw {
    pub current_high: Option<u8>,
    pub current_low: Option<u8>,
    pub voltage: Option<u16>,
}

impl BatteryRaw {
    /// Current magnitude in amperes
    ///
    /// Values above 32767 are two's-complement negatives; their magnitude
    /// `65536 - x` is reported.
    pub fn current_amps(&self) -> Option<f64> {
        let x = u32::from(self.current_high?) * 256 + u32::from(self.current_low?);
        let magnitude = if x > 32767 { 65536 - x } else { x };
        Some(f64::from(magnitude) * 0.1 + 0.05)
    }

    /// Battery voltage in volts
    pub fn voltage_volts(&self) -> Option<f64> {
        Some(f64::from(self.voltage?) * 0.1 + 0.05)
    }

    /// Current formatted for display, e.g. `14.2A`
    pub fn current_display(&self) -> Option<String> {
        self.current_amps().map(|a| format!("{}A", format_tenths(a)))
    }

    /// Voltage formatted for display, e.g. `130.0V`
    pub fn voltage_display(&self) -> Option<String> {
        self.voltage_volts().map(|v| format!("{}V", format_tenths(v)))
    }
}

/// Format with one decimal, truncating further digits
pub fn format_tenths(value: f64) -> String {
    format!("{:.1}", (value * 10.0).trunc() / 10.0)
}

/// Adapter notice that may precede the first data line
const SEARCHING: &str = "SEARCHING...";

/// Split a response into lines, dropping linefeeds, notices and blank lines
pub fn lines(response: &str) -> impl Iterator<Item = &str> {
    response
        .split('\r')
        .map(|line| line.trim_matches(|c: char| c == '\n' || c == ' '))
        .map(|line| line.strip_prefix(SEARCHING).unwrap_or(line))
        .filter(|line| !line.is_empty())
}

/// Frames of `response` sent by `header_id`
pub fn frames_from<'a>(response: &'a str, header_id: &'a str) -> impl Iterator<Item = Frame<'a>> {
    lines(response)
        .filter_map(Frame::parse)
        .filter(move |frame| frame.header_id.eq_ignore_ascii_case(header_id))
}

/// Whether any line of `response` starts with `header_id`
pub fn matches_header(response: &str, header_id: &str) -> bool {
    frames_from(response, header_id).next().is_some()
}

/// Line whose id plus frame tag equals `header_id` + `tag`, e.g. `7EC21`
fn tagged_line<'a>(response: &'a str, header_id: &str, tag: &str) -> Option<&'a str> {
    lines(response).find(|line| {
        line.len() >= header_id.len() + tag.len()
            && line.is_char_boundary(header_id.len())
            && line[..header_id.len()].eq_ignore_ascii_case(header_id)
            && line[header_id.len()..].starts_with(tag)
    })
}

fn hex_at(line: &str, (start, end): (usize, usize)) -> Option<u32> {
    let digits = line.get(start..end)?;
    u32::from_str_radix(digits, 16).ok()
}

/// Extract current/voltage components from an extended page 1 reply
///
/// Fails with `DecodeMismatch` when no line comes from `header_id`. Missing
/// individual frames leave the matching component empty.
pub fn decode_battery(response: &str, header_id: &str) -> Result<BatteryRaw, ObdError> {
    if !matches_header(response, header_id) {
        return Err(ObdError::DecodeMismatch(format!("no {} frame", header_id)));
    }
    let mut raw = BatteryRaw::default();
    if let Some(line) = tagged_line(response, header_id, "21") {
        raw.current_high = hex_at(line, CURRENT_HIGH).map(|v| v as u8);
    }
    if let Some(line) = tagged_line(response, header_id, "22") {
        raw.current_low = hex_at(line, CURRENT_LOW).map(|v| v as u8);
        raw.voltage = hex_at(line, VOLTAGE_RAW).map(|v| v as u16);
    }
    Ok(raw)
}

/// Extract the state of charge in percent from an extended page 2 reply
///
/// `Ok(None)` means the ECU answered but frame `24` was missing or short.
pub fn decode_soc(response: &str, header_id: &str) -> Result<Option<f64>, ObdError> {
    if !matches_header(response, header_id) {
        return Err(ObdError::DecodeMismatch(format!("no {} frame", header_id)));
    }
    Ok(tagged_line(response, header_id, "24")
        .and_then(|line| hex_at(line, SOC_RAW))
        .map(|raw| f64::from(raw) / 2.0))
}

/// State of charge formatted for display, e.g. `50%` or `87.5%`
pub fn soc_display(percent: f64) -> String {
    if percent.fract() == 0.0 {
        format!("{}%", percent as u32)
    } else {
        format!("{:.1}%", percent)
    }
}
