//! Radio channel management.
//!
//! The USB dongle and the board talk over a 2.4 GHz link on one of 25
//! channels. The vendor command set lets the host read the shared channel,
//! move both ends, move only the dongle, and ask whether the board is
//! reachable. None of these may run while streaming: their text replies
//! would land in the middle of sample frames.

use std::sync::Arc;

use bioamp_core::{Error, LinkEvent, Result};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::commands::{
    cmd_radio_get_channel, cmd_radio_host_override, cmd_radio_set_channel, cmd_radio_status,
};
use crate::link::{Link, settle};
use crate::protocol::{MAX_RADIO_CHANNEL, SYSTEM_UP_REPLY, parse_radio_channel, trim_reply};

/// Last known radio channel and whether it was read since the last reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadioChannelAssignment {
    pub channel: Option<u8>,
    pub fresh: bool,
}

impl RadioChannelAssignment {
    /// The channel, if it has been read since the link was last re-established.
    pub fn current(&self) -> Option<u8> {
        if self.fresh { self.channel } else { None }
    }

    pub(crate) fn record(&mut self, channel: Option<u8>) {
        self.channel = channel;
        self.fresh = channel.is_some();
    }

    pub(crate) fn invalidate(&mut self) {
        self.fresh = false;
    }
}

/// Ask the board for its radio channel.
///
/// An unreadable reply is logged and yields `None`; only transport failures
/// are errors.
pub(crate) async fn query_channel(link: &mut Link) -> Result<Option<u8>> {
    link.send(&cmd_radio_get_channel()).await?;
    settle(link.timing().radio_query_settle).await;

    let reply = match link.read_text().await {
        Ok(reply) => reply,
        Err(Error::ConnectionSuspect) => None,
        Err(e) => return Err(e),
    };
    let channel = reply.as_deref().and_then(parse_radio_channel);
    match channel {
        Some(channel) => info!(port = %link.state.port, channel, "radio channel"),
        None => warn!(
            port = %link.state.port,
            reply = reply.as_deref().map(trim_reply).unwrap_or("<none>"),
            "cannot identify radio channel number"
        ),
    }
    link.state.radio.record(channel);
    Ok(channel)
}

/// On-demand access to the radio channel commands.
///
/// Every operation takes the link lock for its whole duration and refuses to
/// run while the board is streaming.
#[derive(Clone)]
pub struct RadioChannelManager {
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<LinkEvent>,
}

impl RadioChannelManager {
    pub(crate) fn new(link: Arc<Mutex<Link>>, events: broadcast::Sender<LinkEvent>) -> Self {
        RadioChannelManager { link, events }
    }

    /// The last channel read, without touching the board.
    pub async fn assignment(&self) -> RadioChannelAssignment {
        self.link.lock().await.state.radio
    }

    /// Read the channel shared by dongle and board.
    pub async fn channel(&self) -> Result<Option<u8>> {
        let mut link = self.link.lock().await;
        link.ensure_idle()?;
        let channel = query_channel(&mut link).await?;
        if let Some(channel) = channel {
            let _ = self.events.send(LinkEvent::RadioChannel { channel });
        }
        Ok(channel)
    }

    /// Move both dongle and board to `channel`.
    ///
    /// Returns the board's reply text.
    pub async fn set_channel(&self, channel: u8) -> Result<String> {
        let command = cmd_radio_set_channel(channel)?;
        let mut link = self.link.lock().await;
        link.ensure_idle()?;
        link.send(&command).await?;
        settle(link.timing().radio_query_settle).await;

        let reply = link.read_text().await?.unwrap_or_default();
        if trim_reply(&reply).starts_with("Success") {
            link.state.radio.record(Some(channel));
            info!(port = %link.state.port, channel, "radio channel set");
            let _ = self.events.send(LinkEvent::RadioChannel { channel });
        } else {
            link.state.radio.invalidate();
            warn!(port = %link.state.port, channel, reply = trim_reply(&reply), "radio channel change refused");
        }
        Ok(reply)
    }

    /// Move only the dongle to `channel`, leaving the board where it is.
    pub async fn set_host_override(&self, channel: u8) -> Result<()> {
        let command = cmd_radio_host_override(channel)?;
        let mut link = self.link.lock().await;
        link.ensure_idle()?;
        host_override(&mut link, &command).await
    }

    /// Raw reply to a status request.
    pub async fn status(&self) -> Result<String> {
        let mut link = self.link.lock().await;
        link.ensure_idle()?;
        read_status(&mut link).await
    }

    /// Whether the dongle currently reaches the board.
    pub async fn is_system_up(&self) -> Result<bool> {
        Ok(self.status().await? == SYSTEM_UP_REPLY)
    }

    /// Find the channel the board is listening on.
    ///
    /// Overrides the dongle to each channel from 1 to 25 in turn and stops
    /// at the first one where the status reply reports the system up.
    pub async fn scan_channels(&self) -> Result<u8> {
        let mut link = self.link.lock().await;
        link.ensure_idle()?;

        for channel in 1..=MAX_RADIO_CHANNEL {
            host_override(&mut link, &cmd_radio_host_override(channel)?).await?;
            let override_timeout = link.timing().radio_override_settle;
            link.drain_input(override_timeout).await?;

            let status = read_status(&mut link).await?;
            if status == SYSTEM_UP_REPLY {
                info!(port = %link.state.port, channel, "board found on radio channel");
                link.state.radio.record(Some(channel));
                let _ = self.events.send(LinkEvent::RadioChannel { channel });
                return Ok(channel);
            }
            debug!(channel, status = trim_reply(&status), "no board on radio channel");
        }

        warn!(port = %link.state.port, "board not found on any radio channel");
        link.state.radio.record(None);
        Err(Error::RadioChannelNotFound)
    }
}

async fn host_override(link: &mut Link, command: &[u8]) -> Result<()> {
    link.send(command).await?;
    settle(link.timing().radio_override_settle).await;
    Ok(())
}

async fn read_status(link: &mut Link) -> Result<String> {
    link.send(&cmd_radio_status()).await?;
    let timeout = link.timing().radio_override_settle;
    settle(timeout).await;
    let reply = link.drain_input(timeout).await?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
