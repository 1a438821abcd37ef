//! Command byte builders for the board's ASCII and vendor command sets.
//!
//! All functions are pure. They return the bytes to write to the transport
//! and never touch I/O. Everything except the radio group is a single ASCII
//! character; the radio commands are two or three binary bytes prefixed with
//! `0xF0`.

use bioamp_core::{Error, Result};
use bytes::{BufMut, BytesMut};

use crate::protocol::validate_radio_channel;

// ---------------------------------------------------------------
// Single-character commands
// ---------------------------------------------------------------

/// Soft reset. The board answers with its identification banner.
pub const SOFT_RESET: u8 = b'v';

/// Start binary streaming.
pub const START_STREAM: u8 = b'b';

/// Stop binary streaming.
pub const STOP_STREAM: u8 = b's';

/// Dump the ADC register map as text.
pub const QUERY_REGISTERS: u8 = b'?';

/// Enable the firmware's on-board filters.
pub const ENABLE_FILTERS: u8 = b'f';

/// Disable the firmware's on-board filters.
pub const DISABLE_FILTERS: u8 = b'g';

const CHANNEL_ON: &[u8; 16] = b"!@#$%^&*QWERTYUI";
const CHANNEL_OFF: &[u8; 16] = b"12345678qwertyui";
const CHANNEL_ID: &[u8; 16] = b"12345678QWERTYUI";

// ---------------------------------------------------------------
// Radio commands (0xF0 prefix)
// ---------------------------------------------------------------

const RADIO_PREFIX: u8 = 0xF0;
const RADIO_GET_CHANNEL: u8 = 0x00;
const RADIO_SET_CHANNEL: u8 = 0x01;
const RADIO_HOST_OVERRIDE: u8 = 0x02;
const RADIO_STATUS: u8 = 0x07;

/// Internal ADC test signals selectable with a single command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestSignal {
    /// All inputs connected to ground.
    Ground,
    /// All inputs connected to the supply rail.
    Vcc,
    /// 1x amplitude, slow pulse.
    Pulse1xSlow,
    /// 1x amplitude, fast pulse.
    Pulse1xFast,
    /// 2x amplitude, slow pulse.
    Pulse2xSlow,
    /// 2x amplitude, fast pulse.
    Pulse2xFast,
}

impl TestSignal {
    pub fn command(self) -> u8 {
        match self {
            TestSignal::Ground => b'0',
            TestSignal::Vcc => b'p',
            TestSignal::Pulse1xSlow => b'-',
            TestSignal::Pulse1xFast => b'=',
            TestSignal::Pulse2xSlow => b'[',
            TestSignal::Pulse2xFast => b']',
        }
    }
}

fn channel_index(channel: u8, daisy: bool) -> Result<usize> {
    let limit = if daisy { 16 } else { 8 };
    if channel == 0 || channel > limit {
        return Err(Error::InvalidParameter(format!(
            "channel {channel} out of range 1..={limit}"
        )));
    }
    Ok(usize::from(channel - 1))
}

/// Build the power toggle for one EEG channel.
///
/// Channels 9-16 live on the expansion module and are rejected unless
/// `daisy` is set.
pub fn cmd_set_channel(channel: u8, on: bool, daisy: bool) -> Result<u8> {
    let index = channel_index(channel, daisy)?;
    Ok(if on { CHANNEL_ON[index] } else { CHANNEL_OFF[index] })
}

/// Build an impedance measurement request, `z{channel}{p}{n}Z`.
///
/// `p` and `n` select whether the test current is applied to the positive
/// and negative inputs of the channel. The channel is one ID byte, so
/// channels 9-16 are sent as `QWERTYUI` rather than two digits.
pub fn cmd_impedance(channel: u8, p: bool, n: bool, daisy: bool) -> Result<Vec<u8>> {
    let index = channel_index(channel, daisy)?;
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(b'z');
    buf.put_u8(CHANNEL_ID[index]);
    buf.put_u8(if p { b'1' } else { b'0' });
    buf.put_u8(if n { b'1' } else { b'0' });
    buf.put_u8(b'Z');
    Ok(buf.to_vec())
}

/// Query the radio channel shared by host and board.
pub fn cmd_radio_get_channel() -> Vec<u8> {
    vec![RADIO_PREFIX, RADIO_GET_CHANNEL]
}

/// Move both host and board to `channel`.
pub fn cmd_radio_set_channel(channel: u8) -> Result<Vec<u8>> {
    validate_radio_channel(channel)?;
    Ok(vec![RADIO_PREFIX, RADIO_SET_CHANNEL, channel])
}

/// Move only the host dongle to `channel`.
pub fn cmd_radio_host_override(channel: u8) -> Result<Vec<u8>> {
    validate_radio_channel(channel)?;
    Ok(vec![RADIO_PREFIX, RADIO_HOST_OVERRIDE, channel])
}

/// Ask whether the host can reach the board on its current channel.
pub fn cmd_radio_status() -> Vec<u8> {
    vec![RADIO_PREFIX, RADIO_STATUS]
}
