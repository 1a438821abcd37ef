//! The open link to one board and everything that mutates it.
//!
//! A [`Link`] bundles the transport with its [`LinkState`] and the frame
//! decoding state. The board, stream session, radio manager and watchdog
//! all share one `Arc<tokio::sync::Mutex<Link>>`; holding the lock is what
//! makes a decode cycle, a radio query or a reconnect exclusive.

use std::time::Duration;

use bioamp_core::{Error, Result, Sample, Transport};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::commands::{START_STREAM, STOP_STREAM};
use crate::daisy::DaisyReassembler;
use crate::decoder::{DEFAULT_SKIP_BUDGET, DropCounters, PacketDecoder};
use crate::protocol::{BaudRate, DEFAULT_BAUD, FirmwareVersion, TEXT_TERMINATOR};
use crate::radio::RadioChannelAssignment;

/// Consecutive empty reads tolerated inside one text reply.
const MAX_EMPTY_TEXT_READS: u32 = 10;

/// Settle delays inserted after commands so the firmware can respond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTiming {
    /// After the soft reset that opens the handshake.
    pub reset_settle: Duration,
    /// Before each banner read.
    pub banner_settle: Duration,
    /// Between sending `v` and reading the reply during identification.
    pub probe_settle: Duration,
    /// After radio get/set channel commands.
    pub radio_query_settle: Duration,
    /// After radio host override and status commands.
    pub radio_override_settle: Duration,
    /// After register dumps and impedance requests.
    pub command_settle: Duration,
    /// Between the steps of a soft reconnect.
    pub reconnect_step: Duration,
    /// After the stop command issued by a flush.
    pub flush_settle: Duration,
    /// Per-byte timeout while reading text replies.
    pub text_read_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        LinkTiming {
            reset_settle: Duration::from_secs(1),
            banner_settle: Duration::from_millis(200),
            probe_settle: Duration::from_secs(2),
            radio_query_settle: Duration::from_millis(1500),
            radio_override_settle: Duration::from_millis(100),
            command_settle: Duration::from_millis(500),
            reconnect_step: Duration::from_millis(500),
            flush_settle: Duration::from_secs(1),
            text_read_timeout: Duration::from_secs(1),
        }
    }
}

impl LinkTiming {
    /// No settle delays and short read timeouts, for simulated boards.
    pub fn immediate() -> Self {
        LinkTiming {
            reset_settle: Duration::ZERO,
            banner_settle: Duration::ZERO,
            probe_settle: Duration::ZERO,
            radio_query_settle: Duration::ZERO,
            radio_override_settle: Duration::ZERO,
            command_settle: Duration::ZERO,
            reconnect_step: Duration::ZERO,
            flush_settle: Duration::ZERO,
            text_read_timeout: Duration::from_millis(10),
        }
    }
}

/// Static configuration the link was opened with.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub target_baud: BaudRate,
    pub daisy: bool,
    pub scaled_output: bool,
    pub read_timeout: Duration,
    pub skip_budget: usize,
    /// Bytes written to the board after every reconnect.
    pub init_board_bytes: Vec<u8>,
    pub send_stop_on_stop: bool,
    pub timing: LinkTiming,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            target_baud: BaudRate::default(),
            daisy: false,
            scaled_output: true,
            read_timeout: Duration::from_secs(10),
            skip_budget: DEFAULT_SKIP_BUDGET,
            init_board_bytes: Vec::new(),
            send_stop_on_stop: true,
            timing: LinkTiming::default(),
        }
    }
}

/// Mutable state of one board connection.
#[derive(Debug)]
pub struct LinkState {
    pub port: String,
    /// Current host-side baud rate.
    pub baud_rate: u32,
    pub firmware: FirmwareVersion,
    pub streaming: bool,
    /// Whether the on-board filters were last switched on.
    pub filtering: bool,
    pub drops: DropCounters,
    pub radio: RadioChannelAssignment,
    /// Samples delivered since the last dropped-frame warning.
    pub delivered_since_warning: u64,
    /// Why the watchdog ended streaming, kept for the read loop to report.
    pub last_failure: Option<Error>,
    pub closed: bool,
}

impl LinkState {
    fn new(port: &str) -> Self {
        LinkState {
            port: port.to_string(),
            baud_rate: DEFAULT_BAUD,
            firmware: FirmwareVersion::V1,
            streaming: false,
            filtering: true,
            drops: DropCounters::default(),
            radio: RadioChannelAssignment::default(),
            delivered_since_warning: 0,
            last_failure: None,
            closed: false,
        }
    }
}

/// Transport plus state for one open board.
pub struct Link {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) state: LinkState,
    pub(crate) config: LinkConfig,
    decoder: PacketDecoder,
    daisy: Option<DaisyReassembler>,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>, port: &str, config: LinkConfig) -> Self {
        let decoder = PacketDecoder::new(config.scaled_output, config.skip_budget, config.read_timeout);
        let daisy = config.daisy.then(DaisyReassembler::new);
        Link {
            transport,
            state: LinkState::new(port),
            config,
            decoder,
            daisy,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn timing(&self) -> &LinkTiming {
        &self.config.timing
    }

    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.state.closed {
            return Err(Error::NotConnected);
        }
        trace!(port = %self.state.port, bytes = ?data, "send");
        self.transport.send(data).await
    }

    pub(crate) async fn set_local_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.transport.set_baud_rate(baud_rate).await?;
        debug!(port = %self.state.port, baud_rate, "host baud rate changed");
        self.state.baud_rate = baud_rate;
        Ok(())
    }

    /// Wait for the banner settle delay, then read one text reply.
    pub(crate) async fn read_text(&mut self) -> Result<Option<String>> {
        settle(self.config.timing.banner_settle).await;
        read_text_reply(self.transport.as_mut(), self.config.timing.text_read_timeout).await
    }

    /// Read and discard everything buffered, returning what was read.
    pub(crate) async fn drain_input(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        drain(self.transport.as_mut(), timeout).await
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state.closed {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Refuse commands whose replies would interleave with sample frames.
    pub(crate) fn ensure_idle(&self) -> Result<()> {
        self.ensure_open()?;
        if self.state.streaming {
            Err(Error::StreamingActive)
        } else {
            Ok(())
        }
    }

    /// Send the start command unless the board is already streaming.
    ///
    /// Returns `true` when the command was sent.
    pub(crate) async fn begin_streaming(&mut self) -> Result<bool> {
        if self.state.streaming {
            return Ok(false);
        }
        self.send(&[START_STREAM]).await?;
        self.state.streaming = true;
        Ok(true)
    }

    /// Clear the streaming flag, writing the stop command if asked to.
    pub(crate) async fn halt_streaming(&mut self, send_stop: bool) -> Result<()> {
        self.state.streaming = false;
        if send_stop {
            self.send(&[STOP_STREAM]).await?;
        }
        Ok(())
    }

    /// Decode one frame and run it through daisy pairing.
    ///
    /// `Ok(None)` means a frame was consumed but produced nothing to
    /// deliver yet: it was dropped, or it is the first half of a pair.
    pub(crate) async fn next_delivery(&mut self) -> Result<Option<Sample>> {
        let Some(sample) = self
            .decoder
            .next_frame(self.transport.as_mut(), &mut self.state.drops)
            .await?
        else {
            return Ok(None);
        };
        Ok(match self.daisy.as_mut() {
            Some(daisy) => daisy.push(sample),
            None => Some(sample),
        })
    }

    /// Forget partial frames and unpaired halves.
    pub(crate) fn reset_decoding(&mut self) {
        self.decoder.reset();
        if let Some(daisy) = self.daisy.as_mut() {
            daisy.reset();
        }
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.state.closed {
            return Ok(());
        }
        self.state.closed = true;
        self.state.streaming = false;
        self.transport.close().await
    }
}

/// Sleep for `delay` unless it is zero.
pub(crate) async fn settle(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}

/// Read a `$$$`-terminated text reply one byte at a time.
///
/// Returns `Ok(None)` when nothing arrives at all. Once a reply has started,
/// ten consecutive empty reads mean the board is not really talking and
/// fail with [`Error::ConnectionSuspect`].
pub async fn read_text_reply(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> Result<Option<String>> {
    let mut text = Vec::new();
    let mut byte = [0u8; 1];
    let mut empty_reads = 0u32;

    loop {
        match transport.receive(&mut byte, timeout).await {
            Ok(0) | Err(Error::Timeout) => {
                if text.is_empty() {
                    return Ok(None);
                }
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_TEXT_READS {
                    warn!(
                        partial = %String::from_utf8_lossy(&text),
                        "text reply stopped before terminator"
                    );
                    return Err(Error::ConnectionSuspect);
                }
            }
            Ok(_) => {
                text.push(byte[0]);
                if text.ends_with(TEXT_TERMINATOR.as_bytes()) {
                    let reply = String::from_utf8_lossy(&text).into_owned();
                    debug!(reply = %reply.trim(), "text reply");
                    return Ok(Some(reply));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read until the line goes quiet.
pub(crate) async fn drain(transport: &mut dyn Transport, timeout: Duration) -> Result<Vec<u8>> {
    let mut drained = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match transport.receive(&mut buf, timeout).await {
            Ok(0) | Err(Error::Timeout) => break,
            Ok(n) => drained.extend_from_slice(&buf[..n]),
            Err(e) => return Err(e),
        }
    }
    if !drained.is_empty() {
        trace!(bytes = drained.len(), "drained input");
    }
    Ok(drained)
}

#[cfg(test)]
mod tests {
    use bioamp_test_harness::MockTransport;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn text_reply_reads_through_terminator() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(b"OpenBCI V3\nFirmware: v3.1.2\n$$$extra");
        let handle = mock.handle();

        let reply = read_text_reply(&mut mock, TIMEOUT).await.unwrap().unwrap();
        assert!(reply.ends_with("$$$"));
        assert!(reply.contains("Firmware: v3"));
        // Bytes after the terminator stay buffered.
        assert_eq!(handle.unread_bytes(), 5);
    }

    #[tokio::test]
    async fn silent_line_is_no_reply() {
        let mut mock = MockTransport::new();
        assert_eq!(read_text_reply(&mut mock, TIMEOUT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unterminated_reply_is_suspect() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(b"OpenBCI V3 without end");
        let err = read_text_reply(&mut mock, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionSuspect));
    }

    #[tokio::test]
    async fn drain_empties_the_buffer() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&[1u8; 600]);
        let handle = mock.handle();
        let drained = drain(&mut mock, TIMEOUT).await.unwrap();
        assert_eq!(drained.len(), 600);
        assert_eq!(handle.unread_bytes(), 0);
    }

    #[tokio::test]
    async fn streaming_blocks_commands() {
        let mut mock = MockTransport::new();
        mock.expect(b"b", b"");
        let mut link = Link::new(Box::new(mock), "/dev/ttyUSB0", LinkConfig::default());
        assert!(link.ensure_idle().is_ok());
        assert!(link.begin_streaming().await.unwrap());
        assert!(!link.begin_streaming().await.unwrap());
        assert!(matches!(link.ensure_idle(), Err(Error::StreamingActive)));
    }

    #[test]
    fn immediate_timing_has_no_delays() {
        let timing = LinkTiming::immediate();
        assert!(timing.reset_settle.is_zero());
        assert!(timing.reconnect_step.is_zero());
        assert_eq!(LinkTiming::default().probe_settle, Duration::from_secs(2));
    }
}
