//! Driver for 8- and 16-channel bioamplifier boards on a serial radio link.
//!
//! The board sends fixed 33-byte frames at 250 Hz: a start byte, a
//! sequence ID, eight 24-bit channel values, three 16-bit auxiliary values
//! and an end byte. This crate provides:
//!
//! - **Protocol constants** ([`protocol`]) -- framing bytes, scale factors,
//!   baud rates and firmware classification.
//! - **Command builders** ([`commands`]) -- channel power, test signals,
//!   impedance measurement and radio control commands.
//! - **Frame decoder** ([`decoder`]) -- resynchronising byte-stream decoder
//!   with dropped-frame accounting.
//! - **Daisy pairing** ([`daisy`]) -- merges alternating frames from the
//!   expansion module into 16-channel samples.
//! - **Link bring-up** ([`negotiate`], [`resolver`]) -- port discovery,
//!   firmware detection and baud switching.
//! - **Radio control** ([`radio`]) -- channel query, set and scan.
//! - **Streaming** ([`session`], [`watchdog`]) -- the read loop feeding
//!   [`SampleSink`](bioamp_core::SampleSink)s, and the supervisor that
//!   soft-reconnects a link losing too many frames.
//! - **Board** ([`board`], [`builder`]) -- the connected handle and the
//!   fluent builder that produces it.
//!
//! # Example
//!
//! ```
//! use bioamp_board::decoder::{decode_channel, encode_frame};
//! use bioamp_board::protocol::{FRAME_LEN, START_BYTE};
//!
//! assert_eq!(decode_channel([0xFF, 0xFF, 0xFF]), -1);
//!
//! let frame = encode_frame(3, &[0; 8], &[0; 3]);
//! assert_eq!(frame.len(), FRAME_LEN);
//! assert_eq!(frame[0], START_BYTE);
//! ```

pub mod board;
pub mod builder;
pub mod commands;
pub mod daisy;
pub mod decoder;
pub mod link;
pub mod negotiate;
pub mod protocol;
pub mod radio;
pub mod resolver;
pub mod session;
pub mod watchdog;

pub use board::Board;
pub use builder::BoardBuilder;
pub use protocol::{BaudRate, FirmwareVersion};
pub use radio::RadioChannelManager;
pub use session::{StreamControl, StreamExit, StreamSession};
