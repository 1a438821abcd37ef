//! bioamp-test-harness: Test utilities and mock transports for bioamp.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the driver without a board attached, and [`MockConnector`] for code
//! paths that open their own transports (port discovery, baud-switch
//! confirmation).

pub mod mock_connector;
pub mod mock_serial;

pub use mock_connector::MockConnector;
pub use mock_serial::{MockHandle, MockTransport};
