//! Wire-level constants and text-response parsing for the board protocol.
//!
//! The board speaks two dialects over one serial line: single-byte ASCII
//! commands answered with `$$$`-terminated text, and a continuous stream of
//! fixed 33-byte binary frames once streaming is started. This module holds
//! the constants shared by both plus the pure parsers for the text side
//! (banner classification, radio channel replies).
//!
//! | Firmware | Detected by                   | Baud switch |
//! |----------|-------------------------------|-------------|
//! | V1       | no version tag in banner      | no          |
//! | V2       | `Firmware: v2.`               | yes         |
//! | V3       | `Firmware: v3` or `Rainbow`   | yes         |
//! | V4       | `Firmware: v4`                | yes         |

use std::fmt;

use bioamp_core::{Error, Result};

// ---------------------------------------------------------------
// Frame layout
// ---------------------------------------------------------------

/// First byte of every binary frame.
pub const START_BYTE: u8 = 0xA0;

/// Last byte of every binary frame.
pub const END_BYTE: u8 = 0xC0;

/// Total length of a binary frame, start and end markers included.
pub const FRAME_LEN: usize = 33;

/// EEG channels carried by one frame.
pub const EEG_CHANNELS_PER_FRAME: usize = 8;

/// Width of one EEG channel value on the wire.
pub const CHANNEL_BYTES: usize = 3;

/// Width of one auxiliary value on the wire.
pub const AUX_BYTES: usize = 2;

/// Frames per second produced by the main board.
pub const SAMPLE_RATE_HZ: f64 = 250.0;

// ---------------------------------------------------------------
// Scaling
// ---------------------------------------------------------------

/// ADC reference voltage in volts.
pub const ADC_VREF: f64 = 4.5;

/// Programmable amplifier gain applied by the board firmware.
pub const ADC_GAIN: f64 = 24.0;

/// Microvolts represented by one EEG count.
pub const SCALE_UV_PER_COUNT: f64 = ADC_VREF / ((1u32 << 23) - 1) as f64 / ADC_GAIN * 1_000_000.0;

/// Acceleration in g represented by one auxiliary count.
pub const SCALE_G_PER_COUNT: f64 = 0.002 / 16.0;

// ---------------------------------------------------------------
// Text replies
// ---------------------------------------------------------------

/// Terminator appended by the firmware to every text reply.
pub const TEXT_TERMINATOR: &str = "$$$";

/// Exact reply to a radio status request when both radios are paired.
pub const SYSTEM_UP_REPLY: &str = "Success: System is Up$$$";

/// Baud rate every board powers up at.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Highest radio channel the host dongle accepts.
pub const MAX_RADIO_CHANNEL: u8 = 25;

/// Serial rates the versioned firmware can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BaudRate {
    #[default]
    B115200,
    B230400,
    B921600,
}

impl BaudRate {
    /// Line rate in bits per second.
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B115200 => 115_200,
            BaudRate::B230400 => 230_400,
            BaudRate::B921600 => 921_600,
        }
    }

    /// Two-byte command asking the firmware to move to this rate.
    pub fn switch_command(self) -> [u8; 2] {
        match self {
            BaudRate::B115200 => [0xF0, 0x05],
            BaudRate::B230400 => [0xF0, 0x06],
            BaudRate::B921600 => [0xF0, 0x0A],
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(bps: u32) -> Result<Self> {
        match bps {
            115_200 => Ok(BaudRate::B115200),
            230_400 => Ok(BaudRate::B230400),
            921_600 => Ok(BaudRate::B921600),
            other => Err(Error::InvalidParameter(format!(
                "unsupported baud rate {other}, expected 115200, 230400 or 921600"
            ))),
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

/// Firmware generation, as reported in the soft-reset banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum FirmwareVersion {
    /// Unversioned legacy firmware. Cannot change baud rate.
    #[default]
    V1,
    V2,
    V3,
    V4,
}

impl FirmwareVersion {
    /// Whether the firmware understands the baud-switch and radio commands.
    pub fn is_versioned(self) -> bool {
        self != FirmwareVersion::V1
    }

    /// Classify one chunk of banner text.
    ///
    /// Returns `None` when the text carries no version marker. When several
    /// markers appear the newest generation wins.
    pub fn from_banner(text: &str) -> Option<Self> {
        if text.contains("Firmware: v4") {
            Some(FirmwareVersion::V4)
        } else if text.contains("Firmware: v3") {
            Some(FirmwareVersion::V3)
        } else if text.contains("Firmware: v2.") {
            Some(FirmwareVersion::V2)
        } else if text.contains("Rainbow") {
            // Third-party boards announce themselves this way and speak the v3 dialect.
            Some(FirmwareVersion::V3)
        } else {
            None
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            FirmwareVersion::V1 => "v1",
            FirmwareVersion::V2 => "v2",
            FirmwareVersion::V3 => "v3",
            FirmwareVersion::V4 => "v4",
        };
        f.write_str(tag)
    }
}

/// Whether a banner identifies a supported board.
pub fn is_board_banner(text: &str) -> bool {
    text.contains("OpenBCI") || text.contains("Rainbow")
}

/// Strip the terminator and surrounding whitespace from a text reply.
pub fn trim_reply(text: &str) -> &str {
    let text = text.trim();
    text.strip_suffix(TEXT_TERMINATOR).unwrap_or(text).trim()
}

/// Extract the channel number from a radio channel reply.
///
/// Successful replies end in the channel number, e.g.
/// `Success: Host and Device on Channel Number: 7$$$`. Failure replies,
/// unparseable numbers and out-of-range channels all yield `None`.
pub fn parse_radio_channel(text: &str) -> Option<u8> {
    let body = trim_reply(text);
    if !body.starts_with("Success") {
        return None;
    }
    let digits_end = body.trim_end().len();
    let digits_start = body[..digits_end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map_or(0, |i| i + 1);
    let channel: u8 = body[digits_start..digits_end].parse().ok()?;
    (1..=MAX_RADIO_CHANNEL).contains(&channel).then_some(channel)
}

/// Reject radio channels outside `1..=25`.
pub fn validate_radio_channel(channel: u8) -> Result<()> {
    if (1..=MAX_RADIO_CHANNEL).contains(&channel) {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "radio channel {channel} out of range 1..={MAX_RADIO_CHANNEL}"
        )))
    }
}
