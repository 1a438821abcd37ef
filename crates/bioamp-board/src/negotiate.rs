//! Link bring-up: identification, firmware detection and baud switching.
//!
//! Every board powers up at 115200 baud. After a soft reset it prints a
//! banner naming itself and, on newer firmware, its version. Versioned
//! firmware can then be told to move to a faster rate; the host follows and
//! confirms the board is still alive by probing it on a second connection
//! at the default rate.

use std::sync::Arc;

use bioamp_core::{Connector, Result, Transport};
use tracing::{debug, info, warn};

use crate::commands::SOFT_RESET;
use crate::link::{Link, LinkTiming, read_text_reply, settle};
use crate::protocol::{DEFAULT_BAUD, FirmwareVersion, is_board_banner, trim_reply};
use crate::radio::query_channel;

/// Banner replies read before giving up on the board going quiet.
const MAX_BANNER_REPLIES: usize = 16;

pub struct LinkNegotiator {
    connector: Arc<dyn Connector>,
    timing: LinkTiming,
}

impl LinkNegotiator {
    pub fn new(connector: Arc<dyn Connector>, timing: LinkTiming) -> Self {
        LinkNegotiator { connector, timing }
    }

    /// Soft-reset whatever is on `transport` and check the banner names a board.
    pub async fn identify(&self, transport: &mut dyn Transport) -> Result<bool> {
        transport.send(&[SOFT_RESET]).await?;
        settle(self.timing.probe_settle).await;

        let Some(banner) = read_text_reply(transport, self.timing.text_read_timeout).await? else {
            debug!("no banner in reply to identification probe");
            return Ok(false);
        };
        if banner.contains("Rainbow") {
            info!("Rainbow board detected");
        }
        Ok(is_board_banner(&banner))
    }

    /// Open `path` at the default rate, identify, and close again.
    pub async fn probe_port(&self, path: &str) -> Result<bool> {
        let mut transport = self.connector.open(path, DEFAULT_BAUD).await?;
        let identified = self.identify(transport.as_mut()).await;
        if let Err(e) = transport.close().await {
            debug!(path, error = %e, "closing probe connection failed");
        }
        identified
    }

    /// Soft-reset the board and classify its firmware from the banner.
    pub async fn handshake(&self, link: &mut Link) -> Result<FirmwareVersion> {
        link.send(&[SOFT_RESET]).await?;
        settle(link.timing().reset_settle).await;

        let mut firmware = FirmwareVersion::V1;
        let mut replies = 0;
        while let Some(text) = link.read_text().await? {
            debug!(banner = trim_reply(&text), "banner");
            if let Some(version) = FirmwareVersion::from_banner(&text) {
                firmware = version;
            }
            replies += 1;
            if replies == MAX_BANNER_REPLIES {
                warn!(port = %link.state.port, "board keeps talking, ending handshake");
                break;
            }
        }

        info!(port = %link.state.port, firmware = %firmware, "firmware detected");
        link.state.firmware = firmware;
        Ok(firmware)
    }

    /// Move board and host to the configured baud rate.
    ///
    /// Unversioned firmware stays at the default rate. A failed confirmation
    /// probe is only a warning: the board may already be answering at the
    /// new rate.
    pub async fn switch_baud(&self, link: &mut Link) -> Result<()> {
        let target = link.config().target_baud;
        if !link.state.firmware.is_versioned() {
            info!(
                port = %link.state.port,
                requested = %target,
                "firmware cannot switch baud rate, staying at {DEFAULT_BAUD}"
            );
            return Ok(());
        }

        query_channel(link).await?;

        link.send(&target.switch_command()).await?;
        link.set_local_baud(target.bits_per_second()).await?;
        info!(port = %link.state.port, baud_rate = %target, "serial reconfigured");

        let port = link.state.port.clone();
        match self.probe_port(&port).await {
            Ok(true) => debug!(port = %port, "board confirmed after baud switch"),
            Ok(false) => warn!(port = %port, "board did not identify after baud switch"),
            Err(e) => warn!(port = %port, error = %e, "confirmation probe after baud switch failed"),
        }
        Ok(())
    }

    /// Full bring-up of a freshly opened link.
    pub async fn negotiate(&self, link: &mut Link) -> Result<FirmwareVersion> {
        let firmware = self.handshake(link).await?;
        self.switch_baud(link).await?;
        Ok(firmware)
    }
}
