//! Simulated ELM327 Adapter
//!
//! Behaves like the physical adapter on the wire: AT commands are answered
//! at once, data requests after a fixed "searching" latency with canned
//! multi-frame payloads recorded from a real vehicle. A new data request
//! while one is still searching aborts it with a `STOPPED` notice.

use crate::correlator::ResponseCorrelator;
use crate::error::ObdError;
use crate::protocol::escape_wire;
use crate::transport::{Transport, TransportKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Simulated time between a data request and its reply
pub const SEARCH_LATENCY: Duration = Duration::from_millis(500);

/// Supply voltage reported for `AT RV`
const SUPPLY_VOLTAGE: f64 = 13.1;

const GENERAL_STATUS_HEADERS: &[&str] = &["7EB06410080000001", "7EC06410080000001"];

const GENERAL_STATUS_PLAIN: &[&str] = &["", "410080000001"];

const EXTENDED_PAGE_1_HEADERS: &[&str] = &[
    "7EE037F2112",
    "7EB101E6101000003FF",
    "7EA10166101FFE00000",
    "7EC103D6101FFFFFFFF",
    "7ED102C6101FFFFF800",
    "7EB210838015296BF32",
    "7EA2109211024062F03",
    "7EC21A726482648A3FF",
    "7ED210099AD95D0564F",
    "7EA22000000003E6900",
    "7EB220000000A000F02",
    "7EC22C80F0B17161717",
    "7ED22026A9F02480134",
    "7EB234204A432180018",
    "7EA2307200000000000",
    "7EC231616170017C802",
    "7ED23050543102000C8",
    "7EB2400D0FF00000000",
    "7EC24C8010000820002",
    "7ED24047400C876000F",
    "7EC255E3600025E7E00",
    "7ED25000E01F3962845",
    "7EC2600DF230000D957",
    "7ED26ED000C00000000",
    "7EC27008AA19D090180",
    "7EC280000000003E800",
];

const EXTENDED_PAGE_1_PLAIN: &[&str] = &[
    "016",
    "0:6101FFE00000",
    "7F2112",
    "03D",
    "0:6101FFFFFFFF",
    "02C",
    "0:6101FFFFF800",
    "01E",
    "0:6105FFFFFFFF",
    "1:0921121D062703",
    "1:009A9A96F7569D",
    "1:AF26482648A3FF",
    "1:0838016497BF32",
    "2:00000000456934",
    "2:0111A902490134",
    "2:EB0F2616161616",
    "2:0000000A000302",
    "3:07200000000000",
    "3:050743102000C8",
    "3:1616160016CA07",
    "3:3704DA32D0FFD0",
    "4:021C00C8760010",
    "4:C9010000810002",
    "4:FF610000000000",
    "5:5D7A00025DA300",
    "5:000E01F3974578",
    "6:6B000D00000000",
    "6:00DEDE0000D908",
    "7:008A6A61090183",
    "8:0000000003E800",
];

const EXTENDED_PAGE_2_HEADERS: &[&str] = &[
    "7EA037F2112",
    "7EC102D6105FFFFFFFF",
    "7EB037F2112",
    "7ED037F2112",
    "7EE037F2112",
    "7EC2100000000001617",
    "7EC2217161616172648",
    "7EC2326480001641616",
    "7EC2403E82403E80FAF",
    "7EC25003A0000000000",
    "7EC2600000000000000",
];

const EXTENDED_PAGE_2_PLAIN: &[&str] = &[
    "7F2112",
    "7F2112",
    "02D",
    "0:6105FFFFFFFF",
    "7F2112",
    "7F2112",
    "1:00000000001616",
    "2:16161616162648",
    "3:26480001501515",
    "4:03E82403E80FB8",
    "5:003A0000000000",
    "6:00000000000000",
];

/// Display flags toggled by AT commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterMode {
    pub echo: bool,
    pub linefeeds: bool,
    pub spaces: bool,
    pub headers: bool,
}

impl Default for AdapterMode {
    fn default() -> Self {
        Self {
            echo: true,
            linefeeds: true,
            spaces: true,
            headers: true,
        }
    }
}

/// A data request waiting out its search latency
struct SearchingRequest {
    generation: u64,
    command: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SimState {
    open: bool,
    mode: AdapterMode,
    partial_command: Vec<u8>,
    searching: Option<SearchingRequest>,
    next_generation: u64,
}

impl SimState {
    fn abort_search(&mut self) -> bool {
        match self.searching.take() {
            Some(request) => {
                debug!("Aborting search for {}", request.command);
                request.task.abort();
                true
            }
            None => false,
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process stand-in for an ELM327 adapter
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
    correlator: ResponseCorrelator,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            correlator: ResponseCorrelator::new(),
        }
    }

    /// Current display flags
    pub fn mode(&self) -> AdapterMode {
        lock(&self.state).mode
    }

    /// Whether a data request is still searching
    pub fn is_searching(&self) -> bool {
        lock(&self.state).searching.is_some()
    }

    fn deliver(&self, reply: &str) {
        if !reply.is_empty() {
            debug!("Simulated reply: {}", escape_wire(reply));
            self.correlator.on_bytes_delivered(reply.as_bytes());
        }
    }

    /// Handle one complete command line, returning the immediate reply
    fn process_command(&self, state: &mut SimState, command: &str) -> String {
        let normalized = command.trim().to_lowercase();
        if let Some(at) = normalized.strip_prefix("at") {
            return match at.trim() {
                "d" | "z" => {
                    state.mode = AdapterMode::default();
                    "\rOK\r\r>".to_string()
                }
                "e0" => set_flag(&mut state.mode.echo, false),
                "e1" => set_flag(&mut state.mode.echo, true),
                "l0" => set_flag(&mut state.mode.linefeeds, false),
                "l1" => set_flag(&mut state.mode.linefeeds, true),
                "s0" => set_flag(&mut state.mode.spaces, false),
                "s1" => set_flag(&mut state.mode.spaces, true),
                "h0" => set_flag(&mut state.mode.headers, false),
                "h1" => set_flag(&mut state.mode.headers, true),
                "rv" => format!("{:.1}V\r\r>", SUPPLY_VOLTAGE),
                _ => "\r?\r\r>".to_string(),
            };
        }

        let mut reply = String::new();
        if state.abort_search() {
            reply.push_str("STOPPED\r\r");
        }

        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);
        let shared = Arc::clone(&self.state);
        let correlator = self.correlator.clone();
        let request = command.trim().to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(SEARCH_LATENCY).await;
            let payload = {
                let mut state = lock(&shared);
                if state.searching.as_ref().map(|s| s.generation) != Some(generation) {
                    return;
                }
                let searching = state.searching.take();
                let mode = state.mode;
                searching.map(|s| canned_response(&s.command, mode))
            };
            if let Some(payload) = payload {
                debug!("Simulated reply: {}", escape_wire(&payload));
                correlator.on_bytes_delivered(payload.as_bytes());
            }
        });
        state.searching = Some(SearchingRequest {
            generation,
            command: request,
            task,
        });

        reply.push_str("SEARCHING...");
        reply
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn set_flag(flag: &mut bool, value: bool) -> String {
    *flag = value;
    "\rOK\r\r>".to_string()
}

/// Canned reply to a data request, shaped by the current display flags
fn canned_response(command: &str, mode: AdapterMode) -> String {
    let lines = match (command, mode.headers) {
        ("0100", true) => GENERAL_STATUS_HEADERS,
        ("0100", false) => GENERAL_STATUS_PLAIN,
        ("2101", true) => EXTENDED_PAGE_1_HEADERS,
        ("2101", false) => EXTENDED_PAGE_1_PLAIN,
        ("2105", true) => EXTENDED_PAGE_2_HEADERS,
        ("2105", false) => EXTENDED_PAGE_2_PLAIN,
        _ => return "?\r>".to_string(),
    };
    let separator = if mode.linefeeds { "\r\n" } else { "\r" };
    let mut reply: String = lines
        .iter()
        .map(|line| format!("{}{}", line, separator))
        .collect();
    reply.push_str("\r>");
    reply
}

#[async_trait]
impl Transport for SimulatedAdapter {
    async fn connect(&mut self) -> Result<(), ObdError> {
        let mut state = lock(&self.state);
        if state.open {
            return Err(ObdError::AlreadyOpen);
        }
        state.open = true;
        info!("Serial simulation opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ObdError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(ObdError::NotOpen);
        }
        state.open = false;
        state.abort_search();
        state.partial_command.clear();
        info!("Serial simulation closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let reply = {
            let mut state = lock(&self.state);
            if !state.open {
                return Err(ObdError::NotOpen);
            }
            let mut reply = String::new();
            for &byte in data {
                if byte != b'\n' {
                    state.partial_command.push(byte);
                    continue;
                }
                let line = String::from_utf8_lossy(&state.partial_command).into_owned();
                state.partial_command.clear();
                if state.mode.echo {
                    reply.push_str(&line);
                }
                let immediate = self.process_command(&mut state, &line);
                reply.push_str(&immediate);
            }
            reply
        };
        self.deliver(&reply);
        Ok(())
    }

    fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sim
    }
}
