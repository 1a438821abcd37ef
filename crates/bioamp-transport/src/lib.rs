//! Transport implementations for bioamp.
//!
//! This crate provides the concrete serial implementation of the
//! [`Transport`](bioamp_core::Transport) and
//! [`Connector`](bioamp_core::Connector) traits from `bioamp-core`:
//!
//! - [`SerialTransport`]: the USB radio dongle's virtual COM port
//! - [`SerialConnector`]: opens a [`SerialTransport`] per device path
//! - [`available_port_names`]: the serial ports the system reports
//!
//! # Example
//!
//! ```no_run
//! use bioamp_transport::SerialTransport;
//! use bioamp_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> bioamp_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB0", 115_200).await?;
//!
//! // Soft reset; the board answers with its banner.
//! transport.send(b"v").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{SerialConnector, SerialTransport, available_port_names};
