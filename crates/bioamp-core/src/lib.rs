//! bioamp-core: Core traits, types, and error definitions for bioamp.
//!
//! This crate defines the device-agnostic abstractions that the board
//! driver and its collaborators share. Recording tools, filters, and
//! plotting front-ends depend on these types without pulling in the
//! serial stack or the driver itself.
//!
//! # Key types
//!
//! - [`Transport`] / [`Connector`] -- byte-level communication channel and
//!   the factory that opens one for a device path
//! - [`Sample`] -- one decoded (and possibly reassembled) acquisition sample
//! - [`SampleSink`] -- synchronous consumer of delivered samples
//! - [`LinkEvent`] -- asynchronous link state notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod interchange;
pub mod sink;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use bioamp_core::*`.
pub use error::{Error, Result};
pub use events::LinkEvent;
pub use interchange::{CsvColumn, CsvRow, CsvSampleWriter, parse_csv_row, read_csv};
pub use sink::SampleSink;
pub use transport::{Connector, Transport};
pub use types::{AUX_CHANNELS, Sample};
