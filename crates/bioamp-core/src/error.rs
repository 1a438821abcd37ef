//! Error types for bioamp.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, link-layer, and
//! application-layer errors are all captured here.

/// The error type for all bioamp operations.
///
/// Variants cover the failure modes encountered while talking to the
/// board: opening the port, negotiating the link, keeping frame sync, and
/// recovering from a degraded link.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port configuration, write failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unexpected response text, bad mock script).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No bytes arrived within the per-read timeout.
    #[error("timeout waiting for data")]
    Timeout,

    /// An invalid parameter was passed to a board command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the board has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the board was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The serial device at `path` could not be opened.
    ///
    /// Fatal to this connect attempt only; the resolver moves on to the
    /// next candidate path.
    #[error("port {path} unavailable: {reason}")]
    PortUnavailable {
        /// Device path that failed to open.
        path: String,
        /// Operating system or driver error text.
        reason: String,
    },

    /// Every candidate path was probed and none answered with a board banner.
    #[error("no board found on any candidate serial port")]
    NoDeviceFound,

    /// This platform has no known serial device path convention.
    #[error("platform not supported for port discovery: {0}")]
    PlatformUnsupported(String),

    /// Ten consecutive empty reads while collecting banner text.
    ///
    /// Usually the board is powered off or the dongle is not paired.
    #[error("connection suspect: no response while reading banner")]
    ConnectionSuspect,

    /// The decoder discarded its whole skip budget without seeing a start byte.
    #[error("frame sync lost after skipping {skipped} bytes")]
    FrameSyncLost {
        /// Number of bytes discarded while hunting for the start byte.
        skipped: usize,
    },

    /// A read timed out in the middle of decoding; the device stopped sending.
    #[error("device stalled")]
    DeviceStalled,

    /// A radio channel scan found no channel reporting the board as up.
    #[error("no radio channel reported the board as up")]
    RadioChannelNotFound,

    /// The operation writes a command whose response would interleave with
    /// sample frames, and the link is currently streaming.
    #[error("operation not allowed while streaming")]
    StreamingActive,

    /// The soft reconnect sequence kept failing until the attempt cap.
    #[error("reconnect failed after {attempts} attempts: {source}")]
    ReconnectFailed {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the last attempt.
        #[source]
        source: Box<Error>,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for link-local failures that hand control to the
    /// reconnect path instead of being reported straight to the caller.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::DeviceStalled | Error::FrameSyncLost { .. } | Error::ConnectionLost | Error::Timeout
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
