//! Transport trait for board communication.
//!
//! The [`Transport`] trait abstracts over the physical link to the board.
//! The driver in `bioamp-board` operates on a `Transport` rather than
//! directly on a serial port, enabling both real hardware and deterministic
//! unit testing with `MockTransport` from the `bioamp-test-harness` crate.
//!
//! A [`Connector`] opens transports by device path. The driver needs one
//! because link negotiation confirms a baud switch on a second, independent
//! connection, and port discovery probes several candidate paths.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};

/// Asynchronous byte-level transport to a board.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Framing (start/end bytes, banner terminators) is handled by the
/// driver that consumes this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the board.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying transport.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the board into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`] if no data is received
    /// within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Fill `buf` completely.
    ///
    /// `timeout` applies to each underlying read, not to the whole buffer:
    /// bytes that trickle in slowly are fine as long as no single wait
    /// exceeds it. Returns [`Error::Timeout`] when one does.
    async fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.receive(&mut buf[filled..], timeout).await?;
            if n == 0 {
                return Err(Error::ConnectionLost);
            }
            filled += n;
        }
        Ok(())
    }

    /// Change the local baud rate of the link.
    ///
    /// Only the host side changes; telling the board to switch is the
    /// driver's job.
    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Opens transports to a device path.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `path` at `baud_rate`.
    ///
    /// Returns [`Error::PortUnavailable`] when the path cannot be opened.
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn Transport>>;
}
