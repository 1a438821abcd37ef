//! Mock connector handing out pre-built [`MockTransport`]s.
//!
//! Port discovery and baud-switch confirmation open their own transports.
//! [`MockConnector`] lets a test decide, per device path, which scripted
//! transport each successive `open()` returns.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bioamp_core::error::{Error, Result};
use bioamp_core::transport::{Connector, Transport};

use crate::mock_serial::MockTransport;

/// A [`Connector`] backed by queues of [`MockTransport`]s.
///
/// Opening a path with nothing queued fails with
/// [`Error::PortUnavailable`], like a missing device node.
#[derive(Debug, Default)]
pub struct MockConnector {
    transports: Mutex<HashMap<String, VecDeque<MockTransport>>>,
    opened: Mutex<Vec<(String, u32)>>,
}

impl MockConnector {
    /// Create a connector with no transports queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `transport` as the next one returned for `path`.
    pub fn add(&self, path: &str, transport: MockTransport) {
        self.transports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(path.to_string())
            .or_default()
            .push_back(transport);
    }

    /// Builder-style variant of [`add`](Self::add).
    pub fn with(self, path: &str, transport: MockTransport) -> Self {
        self.add(path, transport);
        self
    }

    /// Every `(path, baud_rate)` passed to `open()`, including failed opens.
    pub fn opened(&self) -> Vec<(String, u32)> {
        self.opened.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn Transport>> {
        self.opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((path.to_string(), baud_rate));

        let next = self
            .transports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(path)
            .and_then(VecDeque::pop_front);

        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(Error::PortUnavailable {
                path: path.to_string(),
                reason: "no mock transport queued".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_returns_queued_transports_in_order() {
        let first = MockTransport::new();
        let second = MockTransport::new();
        let first_handle = first.handle();
        let connector = MockConnector::new()
            .with("/dev/ttyUSB0", first)
            .with("/dev/ttyUSB0", second);

        let mut t = connector.open("/dev/ttyUSB0", 115_200).await.unwrap();
        t.close().await.unwrap();
        assert!(!first_handle.is_connected());

        assert!(connector.open("/dev/ttyUSB0", 115_200).await.is_ok());
        assert!(connector.open("/dev/ttyUSB0", 115_200).await.is_err());
        assert_eq!(connector.opened().len(), 3);
    }

    #[tokio::test]
    async fn open_unknown_path_is_port_unavailable() {
        let connector = MockConnector::new();
        let result = connector.open("/dev/ttyUSB9", 115_200).await;
        assert!(matches!(result, Err(Error::PortUnavailable { .. })));
        assert_eq!(connector.opened(), vec![("/dev/ttyUSB9".to_string(), 115_200)]);
    }
}
