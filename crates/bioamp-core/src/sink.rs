//! Sample consumers.
//!
//! The streaming loop invokes every registered [`SampleSink`] in
//! registration order, synchronously, before decoding the next frame. A
//! slow sink therefore throttles acquisition instead of silently dropping
//! data.
//!
//! # Latency budget
//!
//! The board streams 250 samples per second (125 in daisy mode) and its
//! internal buffering is shallow. All sinks together should return within
//! roughly 4 ms per sample; anything slower makes the serial buffer back up
//! and shows up as dropped packets. Sinks that do heavy work (filtering,
//! plotting, disk I/O with fsync) should hand samples off to their own task.

use crate::error::Result;
use crate::types::Sample;

/// A synchronous consumer of delivered samples.
///
/// An `Err` from a sink is logged by the streaming loop and does not stop
/// acquisition or affect later sinks.
pub trait SampleSink: Send {
    /// Handle one delivered sample.
    fn on_sample(&mut self, sample: &Sample) -> Result<()>;
}

impl<F> SampleSink for F
where
    F: FnMut(&Sample) + Send,
{
    fn on_sample(&mut self, sample: &Sample) -> Result<()> {
        self(sample);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AUX_CHANNELS;

    #[test]
    fn closure_is_a_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |s: &Sample| seen.push(s.sequence_id);
            let sample = Sample::new(7, vec![1.0; 8], [0.0; AUX_CHANNELS]);
            sink.on_sample(&sample).unwrap();
        }
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn boxed_sinks_run_in_order() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = {
            let log = log.clone();
            move |_: &Sample| log.lock().unwrap().push("first")
        };
        let second = {
            let log = log.clone();
            move |_: &Sample| log.lock().unwrap().push("second")
        };
        let mut sinks: Vec<Box<dyn SampleSink>> = vec![Box::new(first), Box::new(second)];
        let sample = Sample::new(0, vec![0.0; 8], [0.0; AUX_CHANNELS]);
        for sink in sinks.iter_mut() {
            sink.on_sample(&sample).unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }
}
