//! Link health checks and the soft reconnect sequence.
//!
//! The watchdog wakes on a fixed interval, looks at the consecutive
//! dropped-frame count, and re-establishes the link when it passes the
//! threshold. The same reconnect sequence is used by the stream session
//! when a read stalls or frame sync is lost.

use std::sync::Arc;
use std::time::Duration;

use bioamp_core::{Error, LinkEvent, Result};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::SOFT_RESET;
use crate::link::{Link, settle};
use crate::protocol::DEFAULT_BAUD;
use crate::radio::query_channel;

/// How the stream session retries a failed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: None,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Re-run the reset and baud-switch sequence on an open link.
///
/// Streaming is stopped first (errors ignored) and restarted at the end when
/// `resume` is set. Leaves the consecutive drop count at zero.
pub(crate) async fn soft_reconnect(link: &mut Link, resume: bool) -> Result<()> {
    link.state.drops.reset_consecutive();
    warn!(port = %link.state.port, "reconnecting");

    if let Err(e) = link.halt_streaming(true).await {
        debug!(error = %e, "stop before reconnect failed");
    }
    let timing = link.timing().clone();
    settle(timing.reconnect_step).await;

    let versioned = link.state.firmware.is_versioned();
    if versioned {
        link.set_local_baud(DEFAULT_BAUD).await?;
    }
    link.send(&[SOFT_RESET]).await?;
    settle(timing.reconnect_step).await;

    if versioned {
        let target = link.config().target_baud;
        link.send(&target.switch_command()).await?;
        link.set_local_baud(target.bits_per_second()).await?;
        settle(timing.reconnect_step).await;
        link.send(&[SOFT_RESET]).await?;
        settle(timing.reconnect_step).await;
    }

    let init = link.config().init_board_bytes.clone();
    if !init.is_empty() {
        link.send(&init).await?;
        settle(timing.reconnect_step).await;
    }

    // Banners from the resets above.
    link.drain_input(timing.text_read_timeout).await?;
    link.reset_decoding();
    link.state.radio.invalidate();
    if versioned {
        query_channel(link).await?;
    }

    if resume {
        link.begin_streaming().await?;
    }
    info!(port = %link.state.port, baud_rate = link.state.baud_rate, "link re-established");
    Ok(())
}

/// One reconnect attempt, resuming streaming if it was running, with events.
pub(crate) async fn reconnect_once(
    link: &mut Link,
    events: &broadcast::Sender<LinkEvent>,
) -> Result<()> {
    let _ = events.send(LinkEvent::Reconnecting { attempt: 1 });
    let resume = link.state.streaming;
    match soft_reconnect(link, resume).await {
        Ok(()) => {
            let _ = events.send(LinkEvent::Reconnected);
            Ok(())
        }
        Err(e) => {
            let _ = events.send(LinkEvent::ReconnectFailed { attempt: 1 });
            Err(e)
        }
    }
}

/// Reconnect until it works, the policy gives up, or `cancel` fires.
pub(crate) async fn recover(
    link: &mut Link,
    policy: &ReconnectPolicy,
    events: &broadcast::Sender<LinkEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let resume = link.state.streaming;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let _ = events.send(LinkEvent::Reconnecting { attempt });
        let error = match soft_reconnect(link, resume).await {
            Ok(()) => {
                let _ = events.send(LinkEvent::Reconnected);
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(attempt, error = %error, "reconnect attempt failed");
        let _ = events.send(LinkEvent::ReconnectFailed { attempt });
        let exhausted = policy.max_attempts.is_some_and(|max| attempt >= max);
        if exhausted || cancel.is_cancelled() {
            return Err(Error::ReconnectFailed {
                attempts: attempt,
                source: Box::new(error),
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::ReconnectFailed {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }
            _ = settle(policy.backoff) => {}
        }
    }
}

/// Periodic dropped-frame check.
pub struct ReconnectWatchdog {
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<LinkEvent>,
    interval: Duration,
    max_dropped_packets: u32,
    policy: ReconnectPolicy,
}

impl ReconnectWatchdog {
    pub(crate) fn new(
        link: Arc<Mutex<Link>>,
        events: broadcast::Sender<LinkEvent>,
        interval: Duration,
        max_dropped_packets: u32,
        policy: ReconnectPolicy,
    ) -> Self {
        ReconnectWatchdog {
            link,
            events,
            interval,
            max_dropped_packets,
            policy,
        }
    }

    /// Run one health check.
    ///
    /// Returns `Ok(true)` when a reconnect was performed. The drop counter is
    /// reset whenever a reconnect is attempted, whether or not it succeeds.
    /// If the policy gives up while a session was streaming, streaming is
    /// ended and the failure is left in the link state for the read loop.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut link = self.link.lock().await;
        if link.state.closed {
            return Ok(false);
        }
        let dropped = link.state.drops.consecutive;
        if dropped <= self.max_dropped_packets {
            return Ok(false);
        }

        warn!(
            dropped,
            threshold = self.max_dropped_packets,
            "too many dropped packets"
        );
        let was_streaming = link.state.streaming;
        match recover(&mut link, &self.policy, &self.events, cancel).await {
            Ok(()) => Ok(true),
            Err(e) if was_streaming => {
                warn!(error = %e, "watchdog reconnect failed, ending stream");
                link.state.streaming = false;
                link.state.last_failure = Some(e);
                let _ = self.events.send(LinkEvent::StreamingStopped);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Run [`tick`](Self::tick) every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> WatchdogHandle {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = self.tick(&token) => {
                        if let Err(e) = result {
                            warn!(error = %e, "watchdog reconnect failed");
                        }
                    }
                }
            }
            debug!("watchdog stopped");
        });
        WatchdogHandle {
            cancel,
            task: Some(task),
        }
    }
}

/// Owner of a running watchdog task. Dropping it stops the task.
pub struct WatchdogHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the watchdog and wait for the task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use bioamp_test_harness::{MockHandle, MockTransport};

    use super::*;
    use crate::link::{LinkConfig, LinkTiming};
    use crate::protocol::{BaudRate, FirmwareVersion};

    const BANNER: &[u8] = b"OpenBCI V3 8-16 channel\nFirmware: v3.1.2\n$$$";

    fn shared_link(mock: MockTransport, firmware: FirmwareVersion) -> Arc<Mutex<Link>> {
        let config = LinkConfig {
            target_baud: BaudRate::B230400,
            timing: LinkTiming::immediate(),
            ..LinkConfig::default()
        };
        let mut link = Link::new(Box::new(mock), "/dev/ttyUSB0", config);
        link.state.firmware = firmware;
        Arc::new(Mutex::new(link))
    }

    fn capped(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: Some(max_attempts),
            backoff: Duration::ZERO,
        }
    }

    fn scripted_reconnect(mock: &mut MockTransport) {
        mock.expect(b"s", b"");
        mock.expect(b"v", BANNER);
        mock.expect(&[0xF0, 0x06], b"");
        mock.expect(b"v", BANNER);
        mock.expect(&[0xF0, 0x00], b"Success: Host and Device on Channel Number: 9$$$");
        mock.expect(b"b", b"");
    }

    fn streaming_link() -> (Arc<Mutex<Link>>, MockHandle) {
        let mut mock = MockTransport::new();
        mock.expect(b"b", b"");
        scripted_reconnect(&mut mock);
        let handle = mock.handle();
        (shared_link(mock, FirmwareVersion::V3), handle)
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let (link, handle) = streaming_link();
        link.lock().await.state.drops.consecutive = 10;
        let (events, _) = broadcast::channel(16);
        let watchdog = ReconnectWatchdog::new(link, events, Duration::from_secs(2), 10, capped(1));

        assert!(!watchdog.tick(&CancellationToken::new()).await.unwrap());
        assert!(handle.sent_data().is_empty());
    }

    #[tokio::test]
    async fn crossing_threshold_reconnects_once() {
        let (link, handle) = streaming_link();
        {
            let mut guard = link.lock().await;
            guard.begin_streaming().await.unwrap();
            guard.state.drops.consecutive = 11;
            guard.state.drops.total = 11;
        }
        let (events, mut rx) = broadcast::channel(16);
        let watchdog = ReconnectWatchdog::new(link.clone(), events, Duration::from_secs(2), 10, capped(1));

        assert!(watchdog.tick(&CancellationToken::new()).await.unwrap());
        {
            let guard = link.lock().await;
            assert_eq!(guard.state.drops.consecutive, 0);
            assert_eq!(guard.state.drops.total, 11);
            assert!(guard.state.streaming);
            assert_eq!(guard.state.baud_rate, 230_400);
            assert_eq!(guard.state.radio.current(), Some(9));
        }
        assert_eq!(
            handle.sent_data(),
            vec![
                b"b".to_vec(),
                b"s".to_vec(),
                b"v".to_vec(),
                vec![0xF0, 0x06],
                b"v".to_vec(),
                vec![0xF0, 0x00],
                b"b".to_vec(),
            ]
        );
        assert_eq!(handle.baud_changes(), vec![115_200, 230_400]);
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnected);

        // The counter is back at zero, so the next tick is quiet.
        assert!(!watchdog.tick(&CancellationToken::new()).await.unwrap());
        assert_eq!(handle.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn failed_reconnect_ends_streaming_with_error() {
        let mut mock = MockTransport::new();
        mock.expect(b"b", b"");
        mock.expect(b"s", b"");
        let link = shared_link(mock, FirmwareVersion::V1);
        {
            let mut guard = link.lock().await;
            guard.begin_streaming().await.unwrap();
            guard.state.drops.consecutive = 11;
        }
        let (events, mut rx) = broadcast::channel(16);
        let watchdog = ReconnectWatchdog::new(link.clone(), events, Duration::from_secs(2), 10, capped(2));

        assert!(watchdog.tick(&CancellationToken::new()).await.unwrap());
        {
            let mut guard = link.lock().await;
            assert!(!guard.state.streaming);
            assert_eq!(guard.state.drops.consecutive, 0);
            assert!(matches!(
                guard.state.last_failure.take(),
                Some(Error::ReconnectFailed { attempts: 2, .. })
            ));
        }
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::ReconnectFailed { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 2 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::ReconnectFailed { attempt: 2 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::StreamingStopped);
    }

    #[tokio::test]
    async fn idle_reconnect_does_not_start_streaming() {
        let mut mock = MockTransport::new();
        mock.expect(b"s", b"");
        mock.expect(b"v", b"OpenBCI V3 8bit Board\n$$$");
        mock.expect(&[0x01, 0x02], b"");
        let handle = mock.handle();
        let config = LinkConfig {
            init_board_bytes: vec![0x01, 0x02],
            timing: LinkTiming::immediate(),
            ..LinkConfig::default()
        };
        let mut link = Link::new(Box::new(mock), "/dev/ttyUSB0", config);

        soft_reconnect(&mut link, false).await.unwrap();
        assert!(!link.state.streaming);
        // Legacy firmware never changes rate.
        assert!(handle.baud_changes().is_empty());
        assert_eq!(handle.remaining_expectations(), 0);
        assert_eq!(handle.unread_bytes(), 0);
    }

    #[tokio::test]
    async fn recover_gives_up_after_cap() {
        let link = shared_link(MockTransport::new(), FirmwareVersion::V1);
        let (events, mut rx) = broadcast::channel(16);
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            backoff: Duration::ZERO,
        };
        let cancel = CancellationToken::new();

        let mut guard = link.lock().await;
        let err = recover(&mut guard, &policy, &events, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReconnectFailed { attempts: 2, .. }));
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::ReconnectFailed { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 2 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::ReconnectFailed { attempt: 2 });
    }

    #[tokio::test]
    async fn cancelled_recovery_stops_retrying() {
        let link = shared_link(MockTransport::new(), FirmwareVersion::V1);
        let (events, _) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut guard = link.lock().await;
        let err = recover(&mut guard, &ReconnectPolicy::default(), &events, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReconnectFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn spawned_watchdog_reconnects_and_stops_on_cancel() {
        let (link, handle) = streaming_link();
        {
            let mut guard = link.lock().await;
            guard.begin_streaming().await.unwrap();
            guard.state.drops.consecutive = 50;
        }
        let (events, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let watchdog = ReconnectWatchdog::new(link.clone(), events, Duration::from_millis(5), 10, capped(1))
            .spawn(cancel.clone());

        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnecting { attempt: 1 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Reconnected);
        assert!(watchdog.is_running());

        watchdog.shutdown().await;
        let sent = handle.sent_data().len();
        link.lock().await.state.drops.consecutive = 50;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.sent_data().len(), sent);
    }
}
