// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Channel directory
//!
//! Maps the device IP channel slot table to logical channel ids.

use log::{debug, warn};
use serde::Serialize;

use crate::error::DiscoveryError;
use crate::protocol::ChannelConfig;
use crate::session::Session;

/// Logical video channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Channel {
    /// Logical channel id (slot index + start channel number)
    pub id: u32,
    /// Slot enable flag
    pub enabled: bool,
}

/// Logical channel id of a slot, or `None` if it does not fit in a `u32`
pub fn logical_channel_id(slot: usize, start_channel: u32) -> Option<u32> {
    u32::try_from(slot)
        .ok()
        .and_then(|slot| start_channel.checked_add(slot))
}

/// Enabled channels of a configuration table, in slot order
pub fn enabled_channels(config: &ChannelConfig) -> Result<Vec<Channel>, DiscoveryError> {
    config
        .slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.enabled)
        .map(|(slot, _)| {
            let id = logical_channel_id(slot, config.start_channel).ok_or(
                DiscoveryError::ChannelIdOverflow {
                    slot,
                    start_channel: config.start_channel,
                },
            )?;
            Ok(Channel { id, enabled: true })
        })
        .collect()
}

/// Query the device and list its enabled channels in slot order
pub fn list_enabled_channels(session: &Session) -> Result<Vec<Channel>, DiscoveryError> {
    let handle = session.handle().ok_or(DiscoveryError::NotConnected)?;

    let config = session.client().query_channel_config(handle).map_err(|e| {
        warn!("Channel configuration query failed: {e}");
        DiscoveryError::Query(e)
    })?;

    let channels = enabled_channels(&config).inspect_err(|e| warn!("{e}"))?;
    debug!(
        "Channel table: {} slots, start channel {}, {} enabled",
        config.slots.len(),
        config.start_channel,
        channels.len()
    );
    Ok(channels)
}
