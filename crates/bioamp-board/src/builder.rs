//! BoardBuilder -- fluent builder for constructing [`Board`] instances.
//!
//! Separates configuration from connection so that callers can choose the
//! port, target baud rate, expansion module, timeouts and reconnect policy
//! before the link is opened and negotiated.
//!
//! # Example
//!
//! ```no_run
//! use bioamp_board::builder::BoardBuilder;
//! use bioamp_board::protocol::BaudRate;
//! use std::time::Duration;
//!
//! # async fn example() -> bioamp_core::Result<()> {
//! let board = BoardBuilder::new()
//!     .serial_port("/dev/ttyUSB0")
//!     .baud_rate(BaudRate::B230400)
//!     .daisy(true)
//!     .read_timeout(Duration::from_secs(5))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bioamp_core::{Connector, Error, LinkEvent, Result};
use bioamp_transport::SerialConnector;
use tokio::sync::broadcast;
use tracing::info;

use crate::board::{Board, Supervision};
use crate::decoder::DEFAULT_SKIP_BUDGET;
use crate::link::{Link, LinkConfig, LinkTiming};
use crate::negotiate::LinkNegotiator;
use crate::protocol::{BaudRate, DEFAULT_BAUD};
use crate::resolver::PortResolver;
use crate::watchdog::ReconnectPolicy;

/// Capacity of the link event channel.
const EVENT_CAPACITY: usize = 256;

/// Fluent builder for [`Board`].
///
/// Every option has a default, so the simplest usage is:
///
/// ```ignore
/// let board = BoardBuilder::new().build().await?;
/// ```
///
/// which probes this platform's serial ports for a board and connects at
/// 115200 baud.
#[derive(Debug, Clone)]
pub struct BoardBuilder {
    serial_port: Option<String>,
    baud_rate: BaudRate,
    daisy: bool,
    scaled_output: bool,
    read_timeout: Duration,
    skip_budget: usize,
    watchdog_interval: Duration,
    max_dropped_packets: u32,
    max_reconnect_attempts: Option<u32>,
    reconnect_backoff: Duration,
    init_board_bytes: Vec<u8>,
    send_stop_on_stop: bool,
    timing: LinkTiming,
}

impl Default for BoardBuilder {
    fn default() -> Self {
        BoardBuilder::new()
    }
}

impl BoardBuilder {
    pub fn new() -> Self {
        BoardBuilder {
            serial_port: None,
            baud_rate: BaudRate::B115200,
            daisy: false,
            scaled_output: true,
            read_timeout: Duration::from_secs(10),
            skip_budget: DEFAULT_SKIP_BUDGET,
            watchdog_interval: Duration::from_secs(2),
            max_dropped_packets: 10,
            max_reconnect_attempts: None,
            reconnect_backoff: Duration::from_secs(1),
            init_board_bytes: Vec::new(),
            send_stop_on_stop: true,
            timing: LinkTiming::default(),
        }
    }

    /// Serial device to use. Without one, candidate ports are probed.
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Rate to switch to after the handshake. Legacy firmware stays at 115200.
    pub fn baud_rate(mut self, baud: BaudRate) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Expansion module fitted: pair frames into 16-channel samples.
    pub fn daisy(mut self, enabled: bool) -> Self {
        self.daisy = enabled;
        self
    }

    /// Deliver microvolts and g instead of raw counts.
    pub fn scaled_output(mut self, enabled: bool) -> Self {
        self.scaled_output = enabled;
        self
    }

    /// Per-read timeout while streaming. Expiry counts as a stalled board.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Non-start bytes tolerated while hunting for a frame.
    pub fn skip_budget(mut self, bytes: usize) -> Self {
        self.skip_budget = bytes;
        self
    }

    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Consecutive dropped frames above which the watchdog reconnects.
    pub fn max_dropped_packets(mut self, n: u32) -> Self {
        self.max_dropped_packets = n;
        self
    }

    /// Cap on reconnect attempts after a stall. `None` retries forever.
    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Configuration bytes re-sent to the board after every reconnect.
    pub fn init_board_bytes(mut self, bytes: &[u8]) -> Self {
        self.init_board_bytes = bytes.to_vec();
        self
    }

    /// Whether stopping a session writes the stop command to the board.
    pub fn send_stop_on_stop(mut self, enabled: bool) -> Self {
        self.send_stop_on_stop = enabled;
        self
    }

    pub fn timing(mut self, timing: LinkTiming) -> Self {
        self.timing = timing;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.read_timeout.is_zero() {
            return Err(Error::InvalidParameter("read_timeout must be non-zero".into()));
        }
        if self.watchdog_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "watchdog_interval must be non-zero".into(),
            ));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(Error::InvalidParameter(
                "max_reconnect_attempts must allow at least one attempt".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the port if needed, open it through `connector`, and negotiate.
    pub async fn build_with_connector(self, connector: Arc<dyn Connector>) -> Result<Board> {
        self.validate()?;

        let port = match &self.serial_port {
            Some(port) => port.clone(),
            None => {
                PortResolver::new(connector.clone(), self.timing.clone())
                    .resolve()
                    .await?
            }
        };
        info!(port = %port, "connecting");

        let transport = connector.open(&port, DEFAULT_BAUD).await?;
        let config = LinkConfig {
            target_baud: self.baud_rate,
            daisy: self.daisy,
            scaled_output: self.scaled_output,
            read_timeout: self.read_timeout,
            skip_budget: self.skip_budget,
            init_board_bytes: self.init_board_bytes,
            send_stop_on_stop: self.send_stop_on_stop,
            timing: self.timing.clone(),
        };
        let mut link = Link::new(transport, &port, config);

        let negotiator = LinkNegotiator::new(connector, self.timing);
        let firmware = match negotiator.negotiate(&mut link).await {
            Ok(firmware) => firmware,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let supervision = Supervision {
            watchdog_interval: self.watchdog_interval,
            max_dropped_packets: self.max_dropped_packets,
            policy: ReconnectPolicy {
                max_attempts: self.max_reconnect_attempts,
                backoff: self.reconnect_backoff,
            },
        };
        let board = Board::new(link, event_tx.clone(), supervision);
        info!(port = %port, firmware = %firmware, daisy = self.daisy, "board connected");
        let _ = event_tx.send(LinkEvent::Connected {
            port,
            firmware: firmware.to_string(),
        });
        Ok(board)
    }

    /// Connect over the system serial ports.
    pub async fn build(self) -> Result<Board> {
        self.build_with_connector(Arc::new(SerialConnector)).await
    }
}
