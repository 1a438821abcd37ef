//! Mock transport for deterministic testing of the driver.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs plus a queue of unsolicited bytes. That covers
//! both halves of the board protocol: command exchanges (banner, radio
//! channel queries) and the sample stream that follows a start command.
//!
//! # Example
//!
//! ```
//! use bioamp_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the driver sends a soft reset, answer with a banner.
//! mock.expect(b"v", b"OpenBCI V3 8-16 channel\nFirmware: v3.1.2\n$$$");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bioamp_core::error::{Error, Result};
use bioamp_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes that become readable once the matching request is sent.
    response: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// Bytes readable by the next `receive()` calls.
    incoming: VecDeque<u8>,
    /// Whether the transport is "connected".
    connected: bool,
    /// Log of all bytes sent through this transport.
    sent_log: Vec<Vec<u8>>,
    /// Every baud rate passed to `set_baud_rate()`, in order.
    baud_log: Vec<u32>,
}

/// A mock [`Transport`] for testing the driver without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation, and the
/// corresponding response is appended to the readable bytes. `receive()`
/// returns [`Error::Timeout`] whenever nothing is readable.
///
/// The state lives behind a shared handle so a test can keep a
/// [`MockHandle`] for inspection after the transport itself has been moved
/// into the driver.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Inspection handle onto a [`MockTransport`] that has been moved away.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Arc<Mutex<MockState>>) -> MutexGuard<'_, MockState> {
    // A panicking test thread poisons the lock; the data is still usable.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                expectations: VecDeque::new(),
                incoming: VecDeque::new(),
                connected: true,
                sent_log: Vec::new(),
                baud_log: Vec::new(),
            })),
        }
    }

    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, `response`
    /// becomes readable. Pass an empty response for commands the board
    /// does not answer.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Make `data` readable without any preceding request.
    pub fn queue_incoming(&mut self, data: &[u8]) {
        lock(&self.state).incoming.extend(data.iter().copied());
    }

    /// Return a handle for inspecting this transport after it is moved.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }

    /// Return all data that has been sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.handle().sent_data()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.handle().remaining_expectations()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        lock(&self.state).connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// All data sent so far, one element per `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_log.clone()
    }

    /// Number of expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }

    /// Number of bytes still readable.
    pub fn unread_bytes(&self) -> usize {
        lock(&self.state).incoming.len()
    }

    /// Every baud rate set on the transport, in order.
    pub fn baud_changes(&self) -> Vec<u32> {
        lock(&self.state).baud_log.clone()
    }

    /// Whether the transport is still connected.
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Make `data` readable without any preceding request.
    pub fn queue_incoming(&self, data: &[u8]) {
        lock(&self.state).incoming.extend(data.iter().copied());
    }

    /// Add an expected request/response pair.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        // Record what was sent.
        state.sent_log.push(data.to_vec());

        // Match against the next expectation.
        match state.expectations.pop_front() {
            Some(expectation) if data == expectation.request.as_slice() => {
                state.incoming.extend(expectation.response);
                Ok(())
            }
            Some(expectation) => Err(Error::Protocol(format!(
                "unexpected send data: expected {:02X?}, got {:02X?}",
                expectation.request, data
            ))),
            None => Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            )),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        if state.incoming.is_empty() {
            return Err(Error::Timeout);
        }
        let n = state.incoming.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.baud_log.push(baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.incoming.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}
