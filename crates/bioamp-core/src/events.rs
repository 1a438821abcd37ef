//! Asynchronous link event types.
//!
//! Events are emitted by the board driver through a
//! [`tokio::sync::broadcast`] channel when the link state changes.
//! Monitoring front-ends subscribe to these without polling the driver.

/// An event emitted by the board driver when link state changes.
///
/// Events are delivered on a best-effort basis through a bounded broadcast
/// channel; slow consumers may miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link was negotiated and the board identified.
    Connected {
        /// Device path of the open port.
        port: String,
        /// Firmware tag classified from the banner (e.g. `"v3"`).
        firmware: String,
    },

    /// The board was told to start streaming.
    StreamingStarted,

    /// Streaming stopped (explicit stop, elapsed duration, or reconnect).
    StreamingStopped,

    /// A frame ended with something other than the end byte and was dropped.
    PacketDropped {
        /// Sequence ID carried by the dropped frame.
        sequence_id: u8,
        /// The byte found where the end byte should have been.
        found: u8,
    },

    /// A soft reconnect is starting.
    Reconnecting {
        /// The reconnection attempt number (1-based).
        attempt: u32,
    },

    /// A soft reconnect finished and streaming resumed.
    Reconnected,

    /// A soft reconnect attempt failed.
    ReconnectFailed {
        /// The failed attempt number (1-based).
        attempt: u32,
    },

    /// The board reported its radio channel.
    RadioChannel {
        /// Channel number, 1 to 25.
        channel: u8,
    },

    /// The link was closed.
    Disconnected,
}
