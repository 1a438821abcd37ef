//! Core types shared by the driver and sample consumers.

use std::time::Instant;

/// Number of auxiliary (accelerometer) readings carried by every sample.
pub const AUX_CHANNELS: usize = 3;

/// One decoded acquisition sample.
///
/// Created by the packet decoder (or by the daisy reassembler when two
/// single-module samples are merged) and handed to sinks by reference.
/// Values are in physical units (µV and g) when the driver is configured
/// for scaled output, and raw integer counts otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Device-assigned frame counter, wraps modulo 256.
    pub sequence_id: u8,
    /// One reading per active channel: 8, or 16 after daisy reassembly.
    pub channels: Vec<f64>,
    /// Accelerometer readings (X, Y, Z).
    pub aux: [f64; AUX_CHANNELS],
    /// Monotonic timestamp taken when the frame was decoded.
    pub captured_at: Instant,
}

impl Sample {
    /// Create a sample stamped with the current instant.
    pub fn new(sequence_id: u8, channels: Vec<f64>, aux: [f64; AUX_CHANNELS]) -> Self {
        Self::with_timestamp(sequence_id, channels, aux, Instant::now())
    }

    /// Create a sample with an explicit capture timestamp.
    pub fn with_timestamp(
        sequence_id: u8,
        channels: Vec<f64>,
        aux: [f64; AUX_CHANNELS],
        captured_at: Instant,
    ) -> Self {
        Sample {
            sequence_id,
            channels,
            aux,
            captured_at,
        }
    }

    /// Number of channel readings in this sample.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Returns `true` if `next` is the sequence ID expected after this one.
    ///
    /// IDs wrap modulo 256, so 0 follows 255.
    pub fn is_followed_by(&self, next: u8) -> bool {
        self.sequence_id.wrapping_add(1) == next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sample_reports_channel_count() {
        let s = Sample::new(4, vec![0.0; 8], [0.0; AUX_CHANNELS]);
        assert_eq!(s.channel_count(), 8);
        assert_eq!(s.sequence_id, 4);
    }

    #[test]
    fn sequence_wraps_from_255_to_0() {
        let s = Sample::new(255, vec![0.0; 8], [0.0; AUX_CHANNELS]);
        assert!(s.is_followed_by(0));
        assert!(!s.is_followed_by(255));
    }

    #[test]
    fn sequence_follows_incrementally() {
        let s = Sample::new(10, vec![], [0.0; AUX_CHANNELS]);
        assert!(s.is_followed_by(11));
        assert!(!s.is_followed_by(12));
    }
}
