//! Response Correlation
//!
//! Turns the adapter's byte stream into discrete responses. A response ends
//! with the `\r>` prompt marker. At most one read may be outstanding; a new
//! read cancels the previous one instead of queueing behind it.

use crate::error::ObdError;
use crate::protocol::{escape_wire, TERMINATOR};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type ReadResult = Result<String, ObdError>;

/// The single outstanding "await next full response" request
struct PendingRead {
    id: u64,
    started_at: Instant,
    tx: oneshot::Sender<ReadResult>,
}

#[derive(Default)]
struct CorrelatorState {
    received: Vec<u8>,
    pending: Option<PendingRead>,
    next_id: u64,
}

impl CorrelatorState {
    /// Split off everything up to and including the first terminator
    fn take_response(&mut self) -> Option<String> {
        let index = self
            .received
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)?;
        let rest = self.received.split_off(index + TERMINATOR.len());
        let response = std::mem::replace(&mut self.received, rest);
        Some(String::from_utf8_lossy(&response).into_owned())
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(
                "Cancelling pending read after {:?}",
                pending.started_at.elapsed()
            );
            let _ = pending.tx.send(Err(ObdError::Cancelled));
        }
    }
}

/// Receive buffer plus the pending-read slot of one transport
///
/// Cloning yields another handle onto the same buffer, so a transport's
/// reader task can deliver bytes while the poller awaits responses.
#[derive(Clone, Default)]
pub struct ResponseCorrelator {
    state: Arc<Mutex<CorrelatorState>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain the receive buffer, cancel any pending read, return what was buffered
    pub fn clear_and_return_buffered(&self) -> String {
        let mut state = self.lock();
        state.cancel_pending();
        let drained = std::mem::take(&mut state.received);
        String::from_utf8_lossy(&drained).into_owned()
    }

    /// Wait for the next complete response
    ///
    /// A terminator that is already buffered when the read is installed
    /// resolves it immediately. On timeout the buffer is left untouched.
    pub async fn await_next_response(&self, timeout: Duration) -> Result<String, ObdError> {
        let (id, mut rx) = {
            let mut state = self.lock();
            state.cancel_pending();
            if let Some(response) = state.take_response() {
                debug!("Response already buffered: {}", escape_wire(&response));
                return Ok(response);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            state.pending = Some(PendingRead {
                id,
                started_at: Instant::now(),
                tx,
            });
            (id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ObdError::Cancelled),
            Err(_) => {
                let mut state = self.lock();
                if state.pending.as_ref().is_some_and(|p| p.id == id) {
                    state.pending = None;
                    warn!("No response terminator within {}ms", timeout.as_millis());
                    return Err(ObdError::Timeout(timeout.as_millis() as u64));
                }
                drop(state);
                // Completed concurrently with the timer firing
                rx.try_recv().unwrap_or(Err(ObdError::Cancelled))
            }
        }
    }

    /// Append inbound bytes and complete the pending read if a terminator arrived
    pub fn on_bytes_delivered(&self, bytes: &[u8]) {
        debug!(
            "Received data: {}",
            escape_wire(&String::from_utf8_lossy(bytes))
        );
        let mut state = self.lock();
        state.received.extend_from_slice(bytes);
        if state.pending.is_none() {
            return;
        }
        if let Some(response) = state.take_response() {
            if let Some(pending) = state.pending.take() {
                debug!(
                    "Response complete after {:?}: {}",
                    pending.started_at.elapsed(),
                    escape_wire(&response)
                );
                let _ = pending.tx.send(Ok(response));
            }
        }
    }

    /// Whether a read is currently outstanding
    pub fn has_pending_read(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Number of bytes waiting in the receive buffer
    pub fn buffered_len(&self) -> usize {
        self.lock().received.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_terminator() {
        let correlator = ResponseCorrelator::new();
        let reader = correlator.clone();
        let read = tokio::spawn(async move { reader.await_next_response(TIMEOUT).await });
        tokio::task::yield_now().await;

        correlator.on_bytes_delivered(b"7EC06410080000001\r");
        correlator.on_bytes_delivered(b"\r>");
        assert_eq!(read.await.unwrap().unwrap(), "7EC06410080000001\r\r>");
        assert_eq!(correlator.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_residue_kept_for_next_read() {
        let correlator = ResponseCorrelator::new();
        let reader = correlator.clone();
        let read = tokio::spawn(async move { reader.await_next_response(TIMEOUT).await });
        tokio::task::yield_now().await;

        correlator.on_bytes_delivered(b"OK\r\r>SEARCH");
        assert_eq!(read.await.unwrap().unwrap(), "OK\r\r>");
        assert_eq!(correlator.clear_and_return_buffered(), "SEARCH");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_read_cancels_first() {
        let correlator = ResponseCorrelator::new();
        let first_reader = correlator.clone();
        let first = tokio::spawn(async move { first_reader.await_next_response(TIMEOUT).await });
        tokio::task::yield_now().await;
        assert!(correlator.has_pending_read());

        let second_reader = correlator.clone();
        let second = tokio::spawn(async move { second_reader.await_next_response(TIMEOUT).await });
        tokio::task::yield_now().await;

        assert_eq!(first.await.unwrap(), Err(ObdError::Cancelled));
        correlator.on_bytes_delivered(b"?\r>");
        assert_eq!(second.await.unwrap().unwrap(), "?\r>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_buffer() {
        let correlator = ResponseCorrelator::new();
        correlator.on_bytes_delivered(b"SEARCHING...");

        let result = correlator.await_next_response(TIMEOUT).await;
        assert_eq!(result, Err(ObdError::Timeout(1000)));
        assert!(!correlator.has_pending_read());
        assert_eq!(correlator.clear_and_return_buffered(), "SEARCHING...");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_read() {
        let correlator = ResponseCorrelator::new();
        let reader = correlator.clone();
        let read = tokio::spawn(async move { reader.await_next_response(TIMEOUT).await });
        tokio::task::yield_now().await;

        correlator.on_bytes_delivered(b"partial");
        assert_eq!(correlator.clear_and_return_buffered(), "partial");
        assert_eq!(read.await.unwrap(), Err(ObdError::Cancelled));
        assert_eq!(correlator.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminator_buffered_before_read() {
        let correlator = ResponseCorrelator::new();
        correlator.on_bytes_delivered(b"\rOK\r\r>");
        assert!(!correlator.has_pending_read());

        let result = correlator.await_next_response(TIMEOUT).await;
        assert_eq!(result.unwrap(), "\rOK\r\r>");
    }

    proptest! {
        #[test]
        fn prop_response_ends_at_first_terminator(
            head in "[0-9A-F\r]{0,40}",
            tail in "[0-9A-F\r>]{0,40}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let correlator = ResponseCorrelator::new();
                let reader = correlator.clone();
                let read = tokio::spawn(async move { reader.await_next_response(TIMEOUT).await });
                tokio::task::yield_now().await;

                let wire = format!("{}\r>{}", head, tail);
                correlator.on_bytes_delivered(wire.as_bytes());

                let response = read.await.unwrap().unwrap();
                let end = wire.find("\r>").unwrap() + 2;
                prop_assert_eq!(&response, &wire[..end]);
                prop_assert_eq!(correlator.clear_and_return_buffered(), &wire[end..]);
                Ok(())
            })?;
        }
    }
}
