//! Locating the board's serial port.
//!
//! Candidates are the ports the system enumerates, narrowed to each
//! platform's naming for USB serial adapters: `COM*` on Windows,
//! `/dev/ttyUSB*` on Linux and `/dev/tty.usbserial*` on macOS. Each candidate is probed with the
//! identification handshake and the first one that answers with a board
//! banner wins.

use std::sync::Arc;

use bioamp_core::{Connector, Error, Result};
use bioamp_transport::available_port_names;
use tracing::{debug, info, warn};

use crate::link::LinkTiming;
use crate::negotiate::LinkNegotiator;

pub struct PortResolver {
    negotiator: LinkNegotiator,
}

impl PortResolver {
    pub fn new(connector: Arc<dyn Connector>, timing: LinkTiming) -> Self {
        PortResolver {
            negotiator: LinkNegotiator::new(connector, timing),
        }
    }

    /// Probe this platform's candidate paths.
    pub async fn resolve(&self) -> Result<String> {
        let candidates = candidate_paths()?;
        self.resolve_from(&candidates).await
    }

    /// Probe `candidates` in order and return the first one with a board on it.
    ///
    /// Ports that cannot be opened are skipped.
    pub async fn resolve_from(&self, candidates: &[String]) -> Result<String> {
        for path in candidates {
            match self.negotiator.probe_port(path).await {
                Ok(true) => {
                    info!(path = %path, "board found");
                    return Ok(path.clone());
                }
                Ok(false) => debug!(path = %path, "no board banner"),
                Err(Error::PortUnavailable { reason, .. }) => {
                    debug!(path = %path, reason = %reason, "port unavailable")
                }
                Err(e) => warn!(path = %path, error = %e, "probe failed"),
            }
        }
        Err(Error::NoDeviceFound)
    }
}

/// Port-name prefix of USB serial adapters on this platform.
#[cfg(windows)]
const USB_SERIAL_PREFIX: Option<&str> = Some("COM");
#[cfg(target_os = "linux")]
const USB_SERIAL_PREFIX: Option<&str> = Some("/dev/ttyUSB");
#[cfg(target_os = "macos")]
const USB_SERIAL_PREFIX: Option<&str> = Some("/dev/tty.usbserial");
#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
const USB_SERIAL_PREFIX: Option<&str> = None;

/// Serial device paths worth probing on this platform.
pub fn candidate_paths() -> Result<Vec<String>> {
    let Some(prefix) = USB_SERIAL_PREFIX else {
        return Err(Error::PlatformUnsupported(std::env::consts::OS.to_string()));
    };
    let ports = available_port_names()?;
    Ok(filter_candidates(ports, prefix))
}

fn filter_candidates(ports: Vec<String>, prefix: &str) -> Vec<String> {
    ports
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect()
}

#[cfg(test)]
mod tests {
    use bioamp_test_harness::{MockConnector, MockTransport};

    use super::*;

    fn board(banner: &[u8]) -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect(b"v", banner);
        mock
    }

    #[tokio::test]
    async fn first_identified_port_wins() {
        let connector = Arc::new(
            MockConnector::new()
                .with("/dev/ttyUSB1", board(b"GPS receiver$$$"))
                .with("/dev/ttyUSB2", board(b"OpenBCI V3 8-16 channel$$$"))
                .with("/dev/ttyUSB3", board(b"OpenBCI V3 8-16 channel$$$")),
        );
        let resolver = PortResolver::new(connector.clone(), LinkTiming::immediate());
        let candidates: Vec<String> = (0..4).map(|i| format!("/dev/ttyUSB{i}")).collect();

        let port = resolver.resolve_from(&candidates).await.unwrap();
        assert_eq!(port, "/dev/ttyUSB2");
        // ttyUSB0 fails to open and is skipped; ttyUSB3 is never tried.
        let opened: Vec<String> = connector.opened().into_iter().map(|(p, _)| p).collect();
        assert_eq!(opened, vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]);
    }

    #[tokio::test]
    async fn nothing_answering_is_no_device() {
        let connector = Arc::new(MockConnector::new().with("/dev/ttyUSB0", board(b"")));
        let resolver = PortResolver::new(connector, LinkTiming::immediate());

        let err = resolver
            .resolve_from(&["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoDeviceFound));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_no_device() {
        let resolver = PortResolver::new(Arc::new(MockConnector::new()), LinkTiming::immediate());
        assert!(matches!(
            resolver.resolve_from(&[]).await,
            Err(Error::NoDeviceFound)
        ));
    }

    #[test]
    fn candidates_keep_only_usb_serial_names() {
        let ports = vec![
            "/dev/ttyACM0".to_string(),
            "/dev/ttyS0".to_string(),
            "/dev/ttyUSB0".to_string(),
            "/dev/ttyUSB1".to_string(),
        ];
        assert_eq!(
            filter_candidates(ports, "/dev/ttyUSB"),
            vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]
        );
        let ports = vec!["COM3".to_string(), "LPT1".to_string()];
        assert_eq!(filter_candidates(ports, "COM"), vec!["COM3"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_candidates_are_usb_serial() {
        if let Ok(paths) = candidate_paths() {
            assert!(paths.iter().all(|p| p.starts_with("/dev/ttyUSB")));
        }
    }
}
