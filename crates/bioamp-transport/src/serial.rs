//! Serial port transport for board communication.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for the USB radio dongle. The dongle enumerates as a
//! virtual COM port (an FTDI bridge on most hosts) and always starts at
//! 115200 baud, 8 data bits, no parity, 1 stop bit, no flow control. Faster
//! rates are reached by negotiation after the port is open, see
//! [`Transport::set_baud_rate`].
//!
//! # Example
//!
//! ```no_run
//! use bioamp_transport::SerialTransport;
//! use bioamp_core::transport::Transport;
//!
//! # async fn example() -> bioamp_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB0", 115_200).await?;
//! transport.send(b"v").await?;
//! transport.set_baud_rate(230_400).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bioamp_core::error::{Error, Result};
use bioamp_core::transport::{Connector, Transport};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

/// Serial port transport for board communication.
pub struct SerialTransport {
    /// `None` once closed.
    port: Option<SerialStream>,
    port_name: String,
}

impl SerialTransport {
    /// Open `port` at `baud_rate`, 8N1, no flow control.
    ///
    /// A fresh link always starts at 115200.
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        tracing::debug!(port = %port, baud_rate, "opening serial port");

        let serial_stream = tokio_serial::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "serial open failed");
                Error::PortUnavailable {
                    path: port.to_string(),
                    reason: e.to_string(),
                }
            })?;

        tracing::info!(port = %port, baud_rate, "serial opened");

        Ok(Self {
            port: Some(serial_stream),
            port_name: port.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::BrokenPipe || e.kind() == std::io::ErrorKind::NotConnected {
        Error::ConnectionLost
    } else {
        Error::Io(e)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            bytes = data.len(),
            data = ?data,
            "tx"
        );

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "serial write failed");
            map_io_error(e)
        })?;

        // Flush so single-byte commands leave the host immediately.
        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "serial flush failed");
            Error::Io(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    bytes = n,
                    data = ?&buf[..n],
                    "rx"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "serial read failed");
                Err(map_io_error(e))
            }
            Err(_) => {
                tracing::trace!(
                    port = %self.port_name,
                    timeout_ms = timeout.as_millis(),
                    "read timed out"
                );
                Err(Error::Timeout)
            }
        }
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        port.set_baud_rate(baud_rate).map_err(|e| {
            tracing::error!(port = %self.port_name, baud_rate, error = %e, "baud rate change rejected");
            Error::Transport(format!(
                "failed to set {} to {} baud: {}",
                self.port_name, baud_rate, e
            ))
        })?;
        tracing::debug!(port = %self.port_name, baud_rate, "port baud rate set");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            tracing::debug!(port = %self.port_name, "closing serial port");

            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "flush before close failed"
                );
            }

            tracing::info!(port = %self.port_name, "serial port closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "serial transport dropped while open");
        }
    }
}

/// Opens a [`SerialTransport`] for each requested path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn Transport>> {
        let transport = SerialTransport::open(path, baud_rate).await?;
        Ok(Box::new(transport))
    }
}

/// Names of the serial ports the operating system currently reports.
pub fn available_port_names() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Transport(format!("serial port enumeration failed: {e}")))?;
    let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    names.sort();
    names.dedup();
    tracing::debug!(count = names.len(), "serial ports enumerated");
    Ok(names)
}
