// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Device-facing protocol definitions
//!
//! Value types exchanged with the device client: login parameters, the
//! channel configuration table, JPEG request parameters and the tagged
//! result of a still capture.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default device service port
pub const DEFAULT_PORT: u16 = 8000;

/// Number of IP channel slots in the device channel configuration table
pub const MAX_IP_CHANNELS: usize = 64;

/// Capture buffer floor (1MB), applied before the first capture attempt
pub const CAPTURE_BUFFER_FLOOR: usize = 1024 * 1024;

/// Hard ceiling on capture buffer growth (64MB)
pub const CAPTURE_BUFFER_CEILING: usize = 64 * 1024 * 1024;

/// Default connect timeout applied at runtime initialization
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Default reconnect interval applied at runtime initialization
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 10_000;

/// Default delay between forcing a key frame and capturing
pub const DEFAULT_SETTLE_MS: u64 = 50;

/// Opaque identifier of a logged-in device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub i64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encoder stream selector
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    /// Primary (main) stream
    #[default]
    Main = 0,
    /// Secondary (sub) stream
    Sub = 1,
}

impl TryFrom<u32> for StreamType {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamType::Main),
            1 => Ok(StreamType::Sub),
            _ => Err("Invalid stream type value"),
        }
    }
}

/// JPEG picture quality requested from the device encoder
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JpegQuality {
    Best = 0,
    Better = 1,
    Normal = 2,
}

/// JPEG capture parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JpegParams {
    /// Picture quality
    pub quality: JpegQuality,
    /// Picture size code (0xff lets the device use the stream resolution)
    pub size: u16,
}

impl JpegParams {
    /// Size code selecting the current stream resolution
    pub const SIZE_AUTO: u16 = 0xff;
}

impl Default for JpegParams {
    fn default() -> Self {
        Self {
            quality: JpegQuality::Best,
            size: Self::SIZE_AUTO,
        }
    }
}

/// Login parameters handed to the device client
#[derive(Debug, Clone)]
pub struct LoginParams {
    /// Device address (IP or host name)
    pub address: String,
    /// Service port
    pub port: u16,
    /// Account credentials
    pub credentials: Credentials,
}

/// Account credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One slot of the device channel configuration table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSlot {
    /// Slot is configured and enabled
    pub enabled: bool,
}

/// Channel configuration reported by the device
///
/// `slots` holds the configured slot table in slot order. Logical channel
/// ids start at `start_channel`, so slot `i` maps to `start_channel + i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Configured slots
    pub slots: Vec<ChannelSlot>,
    /// First logical channel number
    pub start_channel: u32,
}

/// Outcome of a single still capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillStatus {
    /// Image written to the start of the buffer
    Written(usize),
    /// Buffer was too small; the device may report the size it needs
    BufferTooSmall { required: Option<usize> },
}
