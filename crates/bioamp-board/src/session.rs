//! The streaming read loop.
//!
//! A [`StreamSession`] decodes one frame per cycle under the link lock,
//! releases the lock, and hands the sample to every registered sink in
//! order before decoding the next one. Stopping is observed at the next
//! cycle boundary, never mid-frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bioamp_core::{LinkEvent, Result, Sample, SampleSink};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::Link;
use crate::watchdog::{ReconnectPolicy, recover};

/// Time all sinks together may take per sample before it is logged.
const SINK_LATENCY_BUDGET: Duration = Duration::from_millis(4);

/// Why a session returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// Streaming was stopped from elsewhere or the link was closed.
    Stopped,
    /// The duration limit passed and the session stopped itself.
    DurationElapsed,
}

/// Cloneable handle for stopping a running session.
#[derive(Clone)]
pub struct StreamControl {
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<LinkEvent>,
    stop_requested: Arc<AtomicBool>,
}

impl StreamControl {
    pub(crate) fn new(
        link: Arc<Mutex<Link>>,
        events: broadcast::Sender<LinkEvent>,
        stop_requested: Arc<AtomicBool>,
    ) -> Self {
        StreamControl {
            link,
            events,
            stop_requested,
        }
    }

    /// Ask the running session to stop after the current cycle.
    ///
    /// Does not block, so it can be called from inside a sink.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Stop streaming now, waiting for the current decode cycle to finish.
    pub async fn stop(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        stop_streaming(&mut link, &self.events).await
    }

    pub async fn is_streaming(&self) -> bool {
        self.link.lock().await.state.streaming
    }
}

/// Clear the streaming flag and, if configured, tell the board to stop.
pub(crate) async fn stop_streaming(
    link: &mut Link,
    events: &broadcast::Sender<LinkEvent>,
) -> Result<()> {
    if link.state.closed {
        return Ok(());
    }
    let was_streaming = link.state.streaming;
    let send_stop = link.config.send_stop_on_stop;
    link.halt_streaming(send_stop).await?;
    if was_streaming {
        info!(port = %link.state.port, "streaming stopped");
        let _ = events.send(LinkEvent::StreamingStopped);
    }
    Ok(())
}

pub struct StreamSession {
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<LinkEvent>,
    sinks: Vec<Box<dyn SampleSink>>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    stop_requested: Arc<AtomicBool>,
}

impl StreamSession {
    pub(crate) fn new(
        link: Arc<Mutex<Link>>,
        events: broadcast::Sender<LinkEvent>,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
        stop_requested: Arc<AtomicBool>,
    ) -> Self {
        StreamSession {
            link,
            events,
            sinks: Vec::new(),
            policy,
            cancel,
            stop_requested,
        }
    }

    /// Register a sink. Sinks run in registration order.
    pub fn add_sink(&mut self, sink: impl SampleSink + 'static) -> &mut Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_sink(mut self, sink: impl SampleSink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn control(&self) -> StreamControl {
        StreamControl::new(
            self.link.clone(),
            self.events.clone(),
            self.stop_requested.clone(),
        )
    }

    /// Start streaming and run until stopped.
    ///
    /// With a `duration_limit` the session stops itself once that much
    /// wall-clock time has passed since this call.
    pub async fn start(&mut self, duration_limit: Option<Duration>) -> Result<StreamExit> {
        debug!(sinks = self.sinks.len(), ?duration_limit, "starting stream session");
        self.restream(duration_limit).await
    }

    /// Resume the read loop, sending the start command only if the board is
    /// not already streaming.
    pub async fn restream(&mut self, duration_limit: Option<Duration>) -> Result<StreamExit> {
        self.stop_requested.store(false, Ordering::SeqCst);
        {
            let mut link = self.link.lock().await;
            link.ensure_open()?;
            link.state.last_failure = None;
            if link.begin_streaming().await? {
                info!(port = %link.state.port, "streaming started");
                let _ = self.events.send(LinkEvent::StreamingStarted);
            }
        }
        self.run(duration_limit).await
    }

    async fn run(&mut self, duration_limit: Option<Duration>) -> Result<StreamExit> {
        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(StreamExit::Stopped);
            }
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                self.control().stop().await?;
                return Ok(StreamExit::Stopped);
            }

            let delivery = {
                let mut link = self.link.lock().await;
                if let Some(e) = link.state.last_failure.take() {
                    return Err(e);
                }
                if link.state.closed || !link.state.streaming {
                    return Ok(StreamExit::Stopped);
                }
                let result = link.next_delivery().await;
                self.report_drops(&mut link);
                match result {
                    Ok(Some(sample)) => {
                        link.state.delivered_since_warning += 1;
                        Some(sample)
                    }
                    Ok(None) => None,
                    Err(e) if e.is_link_failure() => {
                        warn!(port = %link.state.port, error = %e, "link failure while streaming");
                        if let Err(e) = recover(&mut link, &self.policy, &self.events, &self.cancel).await
                        {
                            link.state.streaming = false;
                            let _ = self.events.send(LinkEvent::StreamingStopped);
                            return Err(e);
                        }
                        None
                    }
                    Err(e) => {
                        link.state.streaming = false;
                        let _ = self.events.send(LinkEvent::StreamingStopped);
                        return Err(e);
                    }
                }
            };

            if let Some(sample) = delivery {
                self.deliver(&sample);
            }

            if duration_limit.is_some_and(|limit| started.elapsed() >= limit) {
                self.control().stop().await?;
                return Ok(StreamExit::DurationElapsed);
            }
        }
    }

    fn deliver(&mut self, sample: &Sample) {
        let started = Instant::now();
        for (index, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.on_sample(sample) {
                warn!(sink = index, sequence_id = sample.sequence_id, error = %e, "sample sink failed");
            }
        }
        let elapsed = started.elapsed();
        if elapsed > SINK_LATENCY_BUDGET {
            debug!(?elapsed, sequence_id = sample.sequence_id, "sample sinks over latency budget");
        }
    }

    fn report_drops(&self, link: &mut Link) {
        let dropped = link.state.drops.drain_recent();
        if dropped.is_empty() {
            return;
        }
        if link.state.delivered_since_warning > 0 {
            info!(
                received = link.state.delivered_since_warning,
                "data packets received since last warning"
            );
            link.state.delivered_since_warning = 0;
        }
        for frame in dropped {
            let _ = self.events.send(LinkEvent::PacketDropped {
                sequence_id: frame.sequence_id,
                found: frame.found,
            });
        }
    }
}
