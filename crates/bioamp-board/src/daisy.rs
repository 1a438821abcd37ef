//! Pairing of main-board and expansion-module samples.
//!
//! With the expansion module fitted, the two boards take turns: odd sequence
//! ids carry the expansion channels and even ids the main-board channels.
//! An odd sample is parked until its even successor arrives; the pair is
//! then merged into one 16-channel sample with the main-board channels
//! first. Anything that does not pair up is discarded.

use bioamp_core::{AUX_CHANNELS, Sample};
use tracing::trace;

#[derive(Debug, Default)]
pub struct DaisyReassembler {
    pending: Option<Sample>,
}

impl DaisyReassembler {
    pub fn new() -> Self {
        DaisyReassembler::default()
    }

    /// The parked expansion-module half, if any.
    pub fn pending(&self) -> Option<&Sample> {
        self.pending.as_ref()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feed one decoded sample; returns a merged sample when a pair completes.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        if sample.sequence_id % 2 == 1 {
            if let Some(previous) = self.pending.replace(sample) {
                trace!(sequence_id = previous.sequence_id, "unpaired expansion half replaced");
            }
            return None;
        }

        let secondary = self.pending.take();
        match secondary {
            Some(secondary) if secondary.is_followed_by(sample.sequence_id) => {
                Some(merge(sample, &secondary))
            }
            _ => {
                trace!(sequence_id = sample.sequence_id, "main-board half without partner discarded");
                None
            }
        }
    }
}

fn merge(primary: Sample, secondary: &Sample) -> Sample {
    let mut channels = primary.channels;
    channels.extend_from_slice(&secondary.channels);
    let mut aux = [0.0; AUX_CHANNELS];
    for (slot, (a, b)) in aux.iter_mut().zip(primary.aux.iter().zip(&secondary.aux)) {
        *slot = (a + b) / 2.0;
    }
    Sample::with_timestamp(primary.sequence_id, channels, aux, primary.captured_at)
}
