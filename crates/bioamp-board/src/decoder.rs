//! Binary frame decoder.
//!
//! Turns the raw byte stream into [`Sample`]s. Every frame is 33 bytes:
//!
//! ```text
//! A0 | id | ch1..ch8 (3 bytes each, BE two's complement) | ax ay az (2 bytes each) | C0
//! ```
//!
//! The decoder hunts for the start marker, reads a fixed body, and checks the
//! end marker. A wrong end marker drops the frame and resynchronizes on the
//! next start marker; it is counted, never returned as an error. A read that
//! times out mid-stream is reported as [`Error::DeviceStalled`] and left to
//! the caller to recover from.

use std::collections::VecDeque;
use std::time::Duration;

use bioamp_core::{AUX_CHANNELS, Error, Result, Sample, Transport};
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::protocol::{
    AUX_BYTES, CHANNEL_BYTES, EEG_CHANNELS_PER_FRAME, END_BYTE, FRAME_LEN, SCALE_G_PER_COUNT,
    SCALE_UV_PER_COUNT, START_BYTE,
};

/// Default number of non-start bytes tolerated per decode call.
pub const DEFAULT_SKIP_BUDGET: usize = 5000;

/// Most recent drops retained for event reporting when nobody drains them.
const RECENT_DROP_CAP: usize = 64;

/// Sign-extend one big-endian 24-bit channel value.
///
/// A leading byte of `0x7F` or above is treated as negative.
pub fn decode_channel(bytes: [u8; CHANNEL_BYTES]) -> i32 {
    let prefix = if bytes[0] >= 0x7F { 0xFF } else { 0x00 };
    i32::from_be_bytes([prefix, bytes[0], bytes[1], bytes[2]])
}

/// Decode one big-endian 16-bit auxiliary value.
pub fn decode_aux(bytes: [u8; AUX_BYTES]) -> i16 {
    i16::from_be_bytes(bytes)
}

/// Encode a complete frame. Used by simulators and tests.
pub fn encode_frame(
    sequence_id: u8,
    channels: &[i32; EEG_CHANNELS_PER_FRAME],
    aux: &[i16; AUX_CHANNELS],
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_u8(START_BYTE);
    buf.put_u8(sequence_id);
    for value in channels {
        buf.put_slice(&value.to_be_bytes()[1..]);
    }
    for value in aux {
        buf.put_i16(*value);
    }
    buf.put_u8(END_BYTE);
    buf.to_vec()
}

/// Position of the decoder within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitStart,
    ReadChannels,
    ReadAux,
    ReadEnd,
}

/// A frame whose end marker did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedFrame {
    pub sequence_id: u8,
    pub found: u8,
}

/// Dropped-frame accounting shared with the watchdog.
#[derive(Debug, Default, Clone)]
pub struct DropCounters {
    /// Drops since the last good frame or reconnect.
    pub consecutive: u32,
    /// Drops over the lifetime of the link.
    pub total: u64,
    recent: VecDeque<DroppedFrame>,
}

impl DropCounters {
    fn record_drop(&mut self, frame: DroppedFrame) {
        self.consecutive += 1;
        self.total += 1;
        if self.recent.len() == RECENT_DROP_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back(frame);
    }

    fn record_good(&mut self) {
        self.consecutive = 0;
    }

    /// Clear the consecutive count, keeping the lifetime total.
    pub fn reset_consecutive(&mut self) {
        self.consecutive = 0;
    }

    /// Take the drops recorded since the previous call.
    pub fn drain_recent(&mut self) -> Vec<DroppedFrame> {
        self.recent.drain(..).collect()
    }
}

/// Frame state machine over a [`Transport`].
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    state: DecodeState,
    scaled: bool,
    skip_budget: usize,
    read_timeout: Duration,
}

impl PacketDecoder {
    pub fn new(scaled: bool, skip_budget: usize, read_timeout: Duration) -> Self {
        PacketDecoder {
            state: DecodeState::AwaitStart,
            scaled,
            skip_budget,
            read_timeout,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Forget any partial frame. Called after the link is re-established.
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitStart;
    }

    /// Decode the next complete frame.
    ///
    /// A frame with a bad end marker is counted in `drops` and comes back as
    /// `Ok(None)`, so every call ends on a frame boundary.
    pub async fn next_frame(
        &mut self,
        transport: &mut dyn Transport,
        drops: &mut DropCounters,
    ) -> Result<Option<Sample>> {
        let result = self.run(transport, drops).await;
        if result.is_err() {
            self.state = DecodeState::AwaitStart;
        }
        result
    }

    async fn run(
        &mut self,
        transport: &mut dyn Transport,
        drops: &mut DropCounters,
    ) -> Result<Option<Sample>> {
        let mut skipped = 0usize;
        let mut sequence_id = 0u8;
        let mut channels = Vec::with_capacity(EEG_CHANNELS_PER_FRAME);
        let mut aux = [0.0; AUX_CHANNELS];

        loop {
            match self.state {
                DecodeState::AwaitStart => {
                    let [byte] = self.read::<1>(transport).await?;
                    if byte != START_BYTE {
                        skipped += 1;
                        if skipped > self.skip_budget {
                            warn!(skipped, "no start marker within skip budget");
                            return Err(Error::FrameSyncLost { skipped });
                        }
                        continue;
                    }
                    if skipped > 0 {
                        debug!(skipped, "skipped bytes before start marker");
                        skipped = 0;
                    }
                    let [id] = self.read::<1>(transport).await?;
                    sequence_id = id;
                    self.state = DecodeState::ReadChannels;
                }
                DecodeState::ReadChannels => {
                    channels.clear();
                    for _ in 0..EEG_CHANNELS_PER_FRAME {
                        let raw = decode_channel(self.read::<CHANNEL_BYTES>(transport).await?);
                        channels.push(if self.scaled {
                            f64::from(raw) * SCALE_UV_PER_COUNT
                        } else {
                            f64::from(raw)
                        });
                    }
                    self.state = DecodeState::ReadAux;
                }
                DecodeState::ReadAux => {
                    for slot in aux.iter_mut() {
                        let raw = decode_aux(self.read::<AUX_BYTES>(transport).await?);
                        *slot = if self.scaled {
                            f64::from(raw) * SCALE_G_PER_COUNT
                        } else {
                            f64::from(raw)
                        };
                    }
                    self.state = DecodeState::ReadEnd;
                }
                DecodeState::ReadEnd => {
                    let [end] = self.read::<1>(transport).await?;
                    self.state = DecodeState::AwaitStart;
                    if end == END_BYTE {
                        drops.record_good();
                        trace!(sequence_id, "frame decoded");
                        return Ok(Some(Sample::new(sequence_id, channels, aux)));
                    }
                    warn!(
                        sequence_id,
                        found = format_args!("{end:#04x}"),
                        expected = format_args!("{END_BYTE:#04x}"),
                        "unexpected end marker, frame dropped"
                    );
                    drops.record_drop(DroppedFrame {
                        sequence_id,
                        found: end,
                    });
                    return Ok(None);
                }
            }
        }
    }

    async fn read<const N: usize>(&self, transport: &mut dyn Transport) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        match transport.read_exact(&mut buf, self.read_timeout).await {
            Ok(()) => Ok(buf),
            Err(Error::Timeout) => Err(Error::DeviceStalled),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use bioamp_test_harness::MockTransport;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(10);

    fn frame(id: u8) -> Vec<u8> {
        encode_frame(
            id,
            &[1, -1, 0x7F_FFFF, 2, 3, 4, 5, 6],
            &[16, -16, 0],
        )
    }

    #[test]
    fn sign_extension_rule() {
        assert_eq!(decode_channel([0x7F, 0x00, 0x00]), 0xFF7F_0000_u32 as i32);
        assert!(decode_channel([0x7F, 0x00, 0x00]) < 0);
        assert_eq!(decode_channel([0x01, 0x00, 0x00]), 0x0001_0000);
        assert_eq!(decode_channel([0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(decode_channel([0x00, 0x00, 0x05]), 5);
    }

    #[test]
    fn aux_is_signed_big_endian() {
        assert_eq!(decode_aux([0xFF, 0xF0]), -16);
        assert_eq!(decode_aux([0x00, 0x10]), 16);
    }

    #[test]
    fn encoded_frame_layout() {
        let bytes = frame(9);
        assert_eq!(bytes.len(), FRAME_LEN);
        assert_eq!(bytes[0], START_BYTE);
        assert_eq!(bytes[1], 9);
        assert_eq!(&bytes[2..5], &[0x00, 0x00, 0x01]);
        assert_eq!(bytes[FRAME_LEN - 1], END_BYTE);
    }

    #[tokio::test]
    async fn decodes_raw_counts() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&frame(42));
        let mut decoder = PacketDecoder::new(false, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        let sample = decoder.next_frame(&mut mock, &mut drops).await.unwrap().unwrap();
        assert_eq!(sample.sequence_id, 42);
        assert_eq!(sample.channels.len(), 8);
        assert_eq!(sample.channels[0], 1.0);
        assert_eq!(sample.channels[1], -1.0);
        // 0x7FFFFF has a 0x7F lead byte and is therefore negative.
        assert_eq!(sample.channels[2], f64::from(decode_channel([0x7F, 0xFF, 0xFF])));
        assert_eq!(sample.aux, [16.0, -16.0, 0.0]);
        assert_eq!(decoder.state(), DecodeState::AwaitStart);
    }

    #[tokio::test]
    async fn scales_to_physical_units() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&frame(1));
        let mut decoder = PacketDecoder::new(true, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        let sample = decoder.next_frame(&mut mock, &mut drops).await.unwrap().unwrap();
        assert!((sample.channels[0] - SCALE_UV_PER_COUNT).abs() < 1e-12);
        assert!((sample.aux[0] - 16.0 * SCALE_G_PER_COUNT).abs() < 1e-12);
    }

    #[tokio::test]
    async fn skips_garbage_before_start() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&[0x00, 0x11, 0xC0, 0x22]);
        mock.queue_incoming(&frame(3));
        let mut decoder = PacketDecoder::new(false, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        let sample = decoder.next_frame(&mut mock, &mut drops).await.unwrap().unwrap();
        assert_eq!(sample.sequence_id, 3);
        assert_eq!(drops.total, 0);
    }

    #[tokio::test]
    async fn bad_end_marker_drops_one_frame_and_resyncs() {
        let mut bad = frame(7);
        bad[FRAME_LEN - 1] = 0x55;
        let mut mock = MockTransport::new();
        mock.queue_incoming(&bad);
        mock.queue_incoming(&frame(8));
        let mut decoder = PacketDecoder::new(false, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        assert!(decoder.next_frame(&mut mock, &mut drops).await.unwrap().is_none());
        assert_eq!(decoder.state(), DecodeState::AwaitStart);
        assert_eq!(drops.consecutive, 1);

        let sample = decoder.next_frame(&mut mock, &mut drops).await.unwrap().unwrap();
        assert_eq!(sample.sequence_id, 8);
        assert_eq!(drops.total, 1);
        // The good frame clears the consecutive run.
        assert_eq!(drops.consecutive, 0);
        assert_eq!(
            drops.drain_recent(),
            vec![DroppedFrame {
                sequence_id: 7,
                found: 0x55
            }]
        );
        assert!(drops.drain_recent().is_empty());
    }

    #[test]
    fn recent_drops_keep_only_the_newest() {
        let mut drops = DropCounters::default();
        for id in 0..70u8 {
            drops.record_drop(DroppedFrame {
                sequence_id: id,
                found: 0,
            });
        }
        let recent = drops.drain_recent();
        assert_eq!(recent.len(), RECENT_DROP_CAP);
        assert_eq!(recent[0].sequence_id, 6);
        assert_eq!(recent[RECENT_DROP_CAP - 1].sequence_id, 69);
        assert_eq!(drops.total, 70);
    }

    #[tokio::test]
    async fn consecutive_drops_accumulate_until_stall() {
        let mut mock = MockTransport::new();
        for id in 0..3 {
            let mut bad = frame(id);
            bad[FRAME_LEN - 1] = 0x00;
            mock.queue_incoming(&bad);
        }
        let mut decoder = PacketDecoder::new(false, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        for _ in 0..3 {
            assert!(decoder.next_frame(&mut mock, &mut drops).await.unwrap().is_none());
        }
        let err = decoder.next_frame(&mut mock, &mut drops).await.unwrap_err();
        assert!(matches!(err, Error::DeviceStalled));
        assert_eq!(drops.consecutive, 3);
        assert_eq!(drops.total, 3);
    }

    #[tokio::test]
    async fn skip_budget_exhaustion_is_sync_loss() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&[0x11; 20]);
        let mut decoder = PacketDecoder::new(false, 10, TIMEOUT);
        let mut drops = DropCounters::default();

        let err = decoder.next_frame(&mut mock, &mut drops).await.unwrap_err();
        assert!(matches!(err, Error::FrameSyncLost { skipped: 11 }));
    }

    #[tokio::test]
    async fn truncated_frame_is_a_stall() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&frame(5)[..20]);
        let mut decoder = PacketDecoder::new(false, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        let err = decoder.next_frame(&mut mock, &mut drops).await.unwrap_err();
        assert!(matches!(err, Error::DeviceStalled));
        assert_eq!(decoder.state(), DecodeState::AwaitStart);
    }

    #[tokio::test]
    async fn sequence_wraparound_is_not_an_error() {
        let mut mock = MockTransport::new();
        mock.queue_incoming(&frame(255));
        mock.queue_incoming(&frame(0));
        let mut decoder = PacketDecoder::new(false, DEFAULT_SKIP_BUDGET, TIMEOUT);
        let mut drops = DropCounters::default();

        let first = decoder.next_frame(&mut mock, &mut drops).await.unwrap().unwrap();
        let second = decoder.next_frame(&mut mock, &mut drops).await.unwrap().unwrap();
        assert!(first.is_followed_by(second.sequence_id));
        assert_eq!(drops.total, 0);
    }
}
