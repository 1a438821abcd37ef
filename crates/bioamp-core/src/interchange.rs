//! CSV interchange for offline analysis tools.
//!
//! The format has three columns, one row per delivered sample:
//!
//! ```text
//! Repetition,Sample Value,FPS
//! 1,-12.5,0
//! 2,-11.75,248.1
//! ```
//!
//! The middle column is named `Filtered` when the producer wrote
//! band-passed values. Some producers wrote a single-element list instead of
//! a scalar (`[-12.5]`); the reader accepts both.

use std::io::{BufRead, Write};
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::sink::SampleSink;
use crate::types::Sample;

/// Which value column a CSV file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvColumn {
    /// Raw decoded values (`Sample Value`).
    Raw,
    /// Values after external filtering (`Filtered`).
    Filtered,
}

impl CsvColumn {
    /// The value column name.
    pub fn name(self) -> &'static str {
        match self {
            CsvColumn::Raw => "Sample Value",
            CsvColumn::Filtered => "Filtered",
        }
    }

    /// The full header line, without a trailing newline.
    pub fn header(self) -> String {
        format!("Repetition,{},FPS", self.name())
    }

    fn from_header(line: &str) -> Option<Self> {
        let line = line.trim();
        [CsvColumn::Raw, CsvColumn::Filtered]
            .into_iter()
            .find(|c| c.header() == line)
    }
}

/// One parsed CSV row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsvRow {
    /// 1-based delivery counter.
    pub repetition: u64,
    /// The selected channel's reading.
    pub value: f64,
    /// Estimated delivery rate in samples per second.
    pub fps: f64,
}

/// Writes one CSV row per delivered sample.
///
/// Usable directly as a [`SampleSink`].
pub struct CsvSampleWriter<W: Write + Send> {
    writer: W,
    channel: usize,
    repetition: u64,
    first_sample_at: Option<Instant>,
}

impl<W: Write + Send> CsvSampleWriter<W> {
    /// Create a writer recording channel index `channel` (0-based) and
    /// write the header immediately.
    pub fn new(mut writer: W, channel: usize, column: CsvColumn) -> Result<Self> {
        writeln!(writer, "{}", column.header())?;
        debug!(channel, column = column.name(), "csv recording started");
        Ok(Self {
            writer,
            channel,
            repetition: 0,
            first_sample_at: None,
        })
    }

    /// Number of rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.repetition
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        debug!(rows = self.repetition, "csv recording flushed");
        Ok(self.writer)
    }

    fn estimate_fps(&self, now: Instant) -> f64 {
        let Some(first) = self.first_sample_at else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            // Intervals between rows, not rows, over the elapsed time.
            (self.repetition - 1) as f64 / elapsed
        }
    }
}

impl<W: Write + Send> SampleSink for CsvSampleWriter<W> {
    fn on_sample(&mut self, sample: &Sample) -> Result<()> {
        let value = *sample.channels.get(self.channel).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "channel index {} out of range for {} channels",
                self.channel,
                sample.channels.len()
            ))
        })?;

        self.repetition += 1;
        if self.first_sample_at.is_none() {
            self.first_sample_at = Some(sample.captured_at);
        }
        let fps = self.estimate_fps(sample.captured_at);
        writeln!(self.writer, "{},{},{}", self.repetition, value, fps)?;
        Ok(())
    }
}

/// Parse one data row.
///
/// The value column may be a bare number, a single-element list literal
/// (`[1.5]`), or either of those wrapped in double quotes.
pub fn parse_csv_row(line: &str) -> Result<CsvRow> {
    let mut fields = line.trim().split(',');
    let (Some(rep), Some(value), Some(fps), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::Protocol(format!("expected 3 CSV fields: {line:?}")));
    };

    let repetition = rep
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::Protocol(format!("bad repetition {rep:?}: {e}")))?;
    let value = parse_value(value)?;
    let fps = fps
        .trim()
        .parse::<f64>()
        .map_err(|e| Error::Protocol(format!("bad FPS {fps:?}: {e}")))?;

    Ok(CsvRow {
        repetition,
        value,
        fps,
    })
}

fn parse_value(field: &str) -> Result<f64> {
    let mut text = field.trim();
    if let Some(inner) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        text = inner.trim();
    }
    if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        text = inner.trim();
    }
    text.parse::<f64>()
        .map_err(|e| Error::Protocol(format!("bad sample value {field:?}: {e}")))
}

/// Read a whole CSV stream: header first, then data rows.
///
/// Blank lines are skipped.
pub fn read_csv<R: BufRead>(reader: R) -> Result<(CsvColumn, Vec<CsvRow>)> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| Error::Protocol("empty CSV input".into()))?;
    let column = CsvColumn::from_header(&header)
        .ok_or_else(|| Error::Protocol(format!("unrecognized CSV header: {header:?}")))?;

    let mut rows = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(parse_csv_row(&line)?);
    }
    debug!(rows = rows.len(), column = column.name(), "csv read");
    Ok((column, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AUX_CHANNELS;
    use std::time::Duration;

    fn sample_at(id: u8, ch2: f64, at: Instant) -> Sample {
        let mut channels = vec![0.0; 8];
        channels[2] = ch2;
        Sample::with_timestamp(id, channels, [0.0; AUX_CHANNELS], at)
    }

    #[test]
    fn writer_emits_header_and_rows() {
        let t0 = Instant::now();
        let mut w = CsvSampleWriter::new(Vec::new(), 2, CsvColumn::Raw).unwrap();
        w.on_sample(&sample_at(0, -1.5, t0)).unwrap();
        w.on_sample(&sample_at(1, 2.25, t0 + Duration::from_millis(4))).unwrap();
        w.on_sample(&sample_at(2, 3.0, t0 + Duration::from_millis(8))).unwrap();
        assert_eq!(w.rows_written(), 3);

        let text = String::from_utf8(w.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Repetition,Sample Value,FPS"));
        assert_eq!(lines.next(), Some("1,-1.5,0"));
        assert_eq!(lines.next(), Some("2,2.25,250"));
        assert_eq!(lines.next(), Some("3,3,250"));
    }

    #[test]
    fn filtered_header() {
        assert_eq!(CsvColumn::Filtered.header(), "Repetition,Filtered,FPS");
    }

    #[test]
    fn writer_rejects_missing_channel() {
        let mut w = CsvSampleWriter::new(Vec::new(), 12, CsvColumn::Raw).unwrap();
        let result = w.on_sample(&sample_at(0, 0.0, Instant::now()));
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
        assert_eq!(w.rows_written(), 0);
    }

    #[test]
    fn parse_scalar_row() {
        let row = parse_csv_row("12,-3.5,249.7").unwrap();
        assert_eq!(row.repetition, 12);
        assert_eq!(row.value, -3.5);
        assert_eq!(row.fps, 249.7);
    }

    #[test]
    fn parse_bracketed_value() {
        let row = parse_csv_row("3,[0.125],250").unwrap();
        assert_eq!(row.value, 0.125);

        let quoted = parse_csv_row("4,\"[ -7.0 ]\",250").unwrap();
        assert_eq!(quoted.value, -7.0);
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert!(parse_csv_row("1,2").is_err());
        assert!(parse_csv_row("1,2,3,4").is_err());
    }

    #[test]
    fn read_csv_round_trips_writer_output() {
        let t0 = Instant::now();
        let mut w = CsvSampleWriter::new(Vec::new(), 2, CsvColumn::Filtered).unwrap();
        w.on_sample(&sample_at(0, 1.0, t0)).unwrap();
        w.on_sample(&sample_at(1, 2.0, t0 + Duration::from_millis(4))).unwrap();
        let bytes = w.into_inner().unwrap();

        let (column, rows) = read_csv(bytes.as_slice()).unwrap();
        assert_eq!(column, CsvColumn::Filtered);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value, 2.0);
        assert_eq!(rows[1].fps, 250.0);
    }

    #[test]
    fn read_csv_rejects_unknown_header() {
        let input = "a,b,c\n1,2,3\n";
        assert!(read_csv(input.as_bytes()).is_err());
    }
}
