//! Board -- the handle to one connected bioamplifier.
//!
//! Ties the negotiated [`Link`] to the stream session, radio manager and
//! watchdog. Constructed through [`BoardBuilder`](crate::builder::BoardBuilder).

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use bioamp_core::{AUX_CHANNELS, Error, LinkEvent, Result};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands::{
    DISABLE_FILTERS, ENABLE_FILTERS, QUERY_REGISTERS, STOP_STREAM, TestSignal, cmd_impedance,
    cmd_set_channel,
};
use crate::link::{Link, settle};
use crate::protocol::{EEG_CHANNELS_PER_FRAME, FirmwareVersion, SAMPLE_RATE_HZ};
use crate::radio::RadioChannelManager;
use crate::session::{StreamControl, StreamExit, StreamSession};
use crate::watchdog::{ReconnectPolicy, ReconnectWatchdog, WatchdogHandle, reconnect_once};

/// Bytes drained by a flush between repeated stop commands.
const FLUSH_STOP_EVERY: usize = 1000;

/// Watchdog and reconnect settings carried from the builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Supervision {
    pub watchdog_interval: Duration,
    pub max_dropped_packets: u32,
    pub policy: ReconnectPolicy,
}

/// A connected board.
///
/// All operations go through one shared link lock, so radio commands,
/// reconnects and decode cycles never overlap on the transport.
pub struct Board {
    link: Arc<Mutex<Link>>,
    event_tx: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
    stop_requested: Arc<AtomicBool>,
    watchdog: StdMutex<Option<WatchdogHandle>>,
    supervision: Supervision,
    port: String,
    firmware: FirmwareVersion,
    daisy: bool,
}

impl Drop for Board {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Dropping the handle aborts the task.
        self.watchdog_slot().take();
    }
}

impl Board {
    pub(crate) fn new(
        link: Link,
        event_tx: broadcast::Sender<LinkEvent>,
        supervision: Supervision,
    ) -> Self {
        let port = link.state.port.clone();
        let firmware = link.state.firmware;
        let daisy = link.config.daisy;
        Board {
            link: Arc::new(Mutex::new(link)),
            event_tx,
            cancel: CancellationToken::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            watchdog: StdMutex::new(None),
            supervision,
            port,
            firmware,
            daisy,
        }
    }

    fn watchdog_slot(&self) -> StdMutexGuard<'_, Option<WatchdogHandle>> {
        self.watchdog.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    pub fn is_daisy(&self) -> bool {
        self.daisy
    }

    /// Delivered samples per second: 250, or 125 with the expansion module.
    pub fn sample_rate(&self) -> f64 {
        if self.daisy {
            SAMPLE_RATE_HZ / 2.0
        } else {
            SAMPLE_RATE_HZ
        }
    }

    pub fn eeg_channel_count(&self) -> usize {
        if self.daisy {
            EEG_CHANNELS_PER_FRAME * 2
        } else {
            EEG_CHANNELS_PER_FRAME
        }
    }

    pub fn aux_channel_count(&self) -> usize {
        AUX_CHANNELS
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// A new session on this board with no sinks registered.
    pub fn session(&self) -> StreamSession {
        StreamSession::new(
            self.link.clone(),
            self.event_tx.clone(),
            self.supervision.policy,
            self.cancel.clone(),
            self.stop_requested.clone(),
        )
    }

    /// Stop handle usable from other tasks and from inside sinks.
    pub fn control(&self) -> StreamControl {
        StreamControl::new(
            self.link.clone(),
            self.event_tx.clone(),
            self.stop_requested.clone(),
        )
    }

    /// Run `session` with the watchdog watching the link.
    pub async fn stream(
        &self,
        session: &mut StreamSession,
        duration_limit: Option<Duration>,
    ) -> Result<StreamExit> {
        self.start_watchdog();
        session.start(duration_limit).await
    }

    /// Start the periodic dropped-packet check if it is not already running.
    pub fn start_watchdog(&self) {
        let mut slot = self.watchdog_slot();
        if slot.as_ref().is_some_and(WatchdogHandle::is_running) || self.cancel.is_cancelled() {
            return;
        }
        let watchdog = ReconnectWatchdog::new(
            self.link.clone(),
            self.event_tx.clone(),
            self.supervision.watchdog_interval,
            self.supervision.max_dropped_packets,
            self.supervision.policy,
        );
        *slot = Some(watchdog.spawn(self.cancel.child_token()));
    }

    pub async fn stop(&self) -> Result<()> {
        self.control().stop().await
    }

    pub async fn is_streaming(&self) -> bool {
        self.link.lock().await.state.streaming
    }

    /// Consecutive and lifetime dropped-frame counts.
    pub async fn dropped_packets(&self) -> (u32, u64) {
        let link = self.link.lock().await;
        (link.state.drops.consecutive, link.state.drops.total)
    }

    pub fn radio(&self) -> RadioChannelManager {
        RadioChannelManager::new(self.link.clone(), self.event_tx.clone())
    }

    /// Re-run the reset and baud-switch sequence now.
    pub async fn reconnect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        link.ensure_open()?;
        reconnect_once(&mut link, &self.event_tx).await
    }

    /// Stop the board and throw away whatever it still had buffered.
    ///
    /// Returns the number of bytes discarded.
    pub async fn flush(&self) -> Result<usize> {
        let mut link = self.link.lock().await;
        link.ensure_idle()?;
        link.send(&[STOP_STREAM]).await?;
        settle(link.timing().flush_settle).await;

        let timeout = link.timing().text_read_timeout;
        let mut discarded = 0;
        let mut since_stop = 0;
        let mut buf = [0u8; 256];
        loop {
            match link.transport.receive(&mut buf, timeout).await {
                Ok(0) | Err(Error::Timeout) => break,
                Ok(n) => {
                    discarded += n;
                    since_stop += n;
                    if since_stop > FLUSH_STOP_EVERY {
                        link.send(&[STOP_STREAM]).await?;
                        since_stop = 0;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        info!(port = %link.state.port, discarded, "input flushed");
        Ok(discarded)
    }

    /// Dump the ADC register map.
    pub async fn register_settings(&self) -> Result<Option<String>> {
        self.text_command(&[QUERY_REGISTERS]).await
    }

    /// Start an impedance measurement on `channel`, applying the test
    /// current to the positive (`p`) and/or negative (`n`) input.
    pub async fn impedance_measurement(&self, channel: u8, p: bool, n: bool) -> Result<Option<String>> {
        let command = cmd_impedance(channel, p, n, self.daisy)?;
        self.text_command(&command).await
    }

    async fn text_command(&self, command: &[u8]) -> Result<Option<String>> {
        let mut link = self.link.lock().await;
        link.ensure_idle()?;
        link.send(command).await?;
        settle(link.timing().command_settle).await;
        link.read_text().await
    }

    async fn byte_command(&self, byte: u8) -> Result<MutexGuard<'_, Link>> {
        let mut link = self.link.lock().await;
        link.ensure_open()?;
        link.send(&[byte]).await?;
        Ok(link)
    }

    pub async fn enable_filters(&self) -> Result<()> {
        self.byte_command(ENABLE_FILTERS).await?.state.filtering = true;
        Ok(())
    }

    pub async fn disable_filters(&self) -> Result<()> {
        self.byte_command(DISABLE_FILTERS).await?.state.filtering = false;
        Ok(())
    }

    pub async fn filters_enabled(&self) -> bool {
        self.link.lock().await.state.filtering
    }

    /// Route an internal test signal to all inputs.
    pub async fn test_signal(&self, signal: TestSignal) -> Result<()> {
        self.byte_command(signal.command()).await?;
        Ok(())
    }

    /// Power a channel up or down. Channels 9-16 need the expansion module.
    pub async fn set_channel(&self, channel: u8, on: bool) -> Result<()> {
        let command = cmd_set_channel(channel, on, self.daisy)?;
        self.byte_command(command).await?;
        Ok(())
    }

    /// Stop streaming, stop the watchdog and close the port.
    pub async fn disconnect(&self) -> Result<()> {
        let watchdog = self.watchdog_slot().take();
        self.cancel.cancel();
        if let Some(watchdog) = watchdog {
            watchdog.shutdown().await;
        }

        let mut link = self.link.lock().await;
        if link.state.closed {
            return Ok(());
        }
        if link.state.streaming {
            if let Err(e) = link.halt_streaming(true).await {
                warn!(error = %e, "stop before disconnect failed");
            }
            let _ = self.event_tx.send(LinkEvent::StreamingStopped);
        }
        link.close().await?;
        info!(port = %link.state.port, "serial closed");
        let _ = self.event_tx.send(LinkEvent::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bioamp_test_harness::{MockHandle, MockTransport};

    use super::*;
    use crate::link::{LinkConfig, LinkTiming};

    fn board_with(mock: MockTransport, daisy: bool) -> (Board, MockHandle) {
        let handle = mock.handle();
        let config = LinkConfig {
            daisy,
            timing: LinkTiming::immediate(),
            ..LinkConfig::default()
        };
        let link = Link::new(Box::new(mock), "/dev/ttyUSB0", config);
        let (event_tx, _) = broadcast::channel(16);
        let supervision = Supervision {
            watchdog_interval: Duration::from_millis(50),
            max_dropped_packets: 10,
            policy: ReconnectPolicy::default(),
        };
        (Board::new(link, event_tx, supervision), handle)
    }

    #[tokio::test]
    async fn flush_discards_and_repeats_stop() {
        let mut mock = MockTransport::new();
        mock.expect(b"s", &[0x55; 1500]);
        mock.expect(b"s", b"");
        let (board, handle) = board_with(mock, false);

        assert_eq!(board.flush().await.unwrap(), 1500);
        assert_eq!(handle.remaining_expectations(), 0);
        assert_eq!(handle.unread_bytes(), 0);
    }

    #[tokio::test]
    async fn flush_refused_while_streaming() {
        let mut mock = MockTransport::new();
        mock.expect(b"b", b"");
        let (board, handle) = board_with(mock, false);
        board.link.lock().await.begin_streaming().await.unwrap();

        assert!(matches!(board.flush().await, Err(Error::StreamingActive)));
        assert_eq!(handle.sent_data(), vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn channel_toggles_use_lookup_tables() {
        let mut mock = MockTransport::new();
        mock.expect(b"!", b"");
        mock.expect(b"8", b"");
        let (board, handle) = board_with(mock, false);

        board.set_channel(1, true).await.unwrap();
        board.set_channel(8, false).await.unwrap();
        assert!(matches!(
            board.set_channel(9, true).await,
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(handle.sent_data().len(), 2);
    }

    #[tokio::test]
    async fn daisy_board_reaches_upper_channels() {
        let mut mock = MockTransport::new();
        mock.expect(b"Q", b"");
        let (board, _handle) = board_with(mock, true);

        board.set_channel(9, true).await.unwrap();
        assert_eq!(board.eeg_channel_count(), 16);
        assert_eq!(board.sample_rate(), 125.0);
    }

    #[tokio::test]
    async fn filter_state_follows_commands() {
        let mut mock = MockTransport::new();
        mock.expect(b"g", b"");
        mock.expect(b"f", b"");
        let (board, _handle) = board_with(mock, false);

        assert!(board.filters_enabled().await);
        board.disable_filters().await.unwrap();
        assert!(!board.filters_enabled().await);
        board.enable_filters().await.unwrap();
        assert!(board.filters_enabled().await);
    }

    #[tokio::test]
    async fn test_signal_sends_its_byte() {
        let mut mock = MockTransport::new();
        mock.expect(b"-", b"");
        let (board, handle) = board_with(mock, false);

        board.test_signal(TestSignal::Pulse1xSlow).await.unwrap();
        assert_eq!(handle.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn text_commands_return_reply() {
        let mut mock = MockTransport::new();
        mock.expect(b"?", b"Board ADS Registers\nID, 00, 3E\n$$$");
        mock.expect(b"z310Z", b"Success: Z ON$$$");
        let (board, _handle) = board_with(mock, false);

        let registers = board.register_settings().await.unwrap().unwrap();
        assert!(registers.starts_with("Board ADS Registers"));
        let reply = board.impedance_measurement(3, true, false).await.unwrap();
        assert_eq!(reply.as_deref(), Some("Success: Z ON$$$"));
    }

    #[tokio::test]
    async fn disconnect_stops_stream_once() {
        let mut mock = MockTransport::new();
        mock.expect(b"b", b"");
        mock.expect(b"s", b"");
        let (board, handle) = board_with(mock, false);
        let mut events = board.subscribe();
        board.link.lock().await.begin_streaming().await.unwrap();

        board.disconnect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::StreamingStopped);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);
        assert!(!handle.is_connected());

        board.disconnect().await.unwrap();
        assert!(events.try_recv().is_err());
        assert!(matches!(board.flush().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn fresh_board_has_no_drops() {
        let (board, _handle) = board_with(MockTransport::new(), false);
        assert_eq!(board.dropped_packets().await, (0, 0));
        assert!(!board.is_streaming().await);
        assert_eq!(board.port(), "/dev/ttyUSB0");
    }
}
