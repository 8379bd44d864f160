// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types
//!
//! Every fallible operation returns one of the typed errors below. A
//! buffer-too-small response from the device never shows up here: the
//! capture protocol recovers from it locally.

use serde::Serialize;

/// Failure category reported by the device client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SdkErrorKind {
    /// Device unreachable or connection refused
    Unreachable,
    /// Connect or response timeout
    Timeout,
    /// Wrong user name or password
    BadCredentials,
    /// Device busy or out of resources
    Busy,
    /// Channel offline or not present
    ChannelOffline,
    /// Handle is not (or no longer) logged in
    NotLoggedIn,
    /// Anything else
    Other,
}

/// Raw failure from the device client: a vendor error code plus its category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("device error {code} ({kind:?})")]
pub struct SdkError {
    pub code: u32,
    pub kind: SdkErrorKind,
}

impl SdkError {
    pub fn new(code: u32, kind: SdkErrorKind) -> Self {
        Self { code, kind }
    }
}

/// Session lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The process-wide device runtime has not been initialized.
    #[error("Device runtime not initialized")]
    NotInitialized,

    /// The device could not be reached, or the connection timed out.
    #[error("Connection to {address} failed: {source}")]
    Connection { address: String, source: SdkError },

    /// The device rejected the credentials.
    #[error("Authentication rejected by {address}: {source}")]
    Auth { address: String, source: SdkError },

    /// Re-login requested on a session that never logged in.
    #[error("No previous login to repeat")]
    NeverLoggedIn,
}

/// Channel discovery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Session not connected")]
    NotConnected,

    #[error("Channel configuration query failed: {0}")]
    Query(SdkError),

    #[error("Slot {slot} with start channel {start_channel} has no valid channel id")]
    ChannelIdOverflow { slot: usize, start_channel: u32 },
}

/// Key frame request errors
///
/// Advisory only: a failed key frame request never blocks a capture.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IFrameError {
    #[error("Session not connected")]
    NotConnected,

    #[error("Key frame request rejected on channel {channel}: {source}")]
    Rejected { channel: u32, source: SdkError },
}

/// Still capture errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The session holds no device handle.
    #[error("Session not connected")]
    NotConnected,

    /// Terminal device failure (auth lost, channel offline, timeout, busy).
    #[error("Device error: {0}")]
    DeviceError(SdkError),

    /// The device asked for more buffer space than the configured ceiling.
    #[error("Capture buffer limit exceeded: {required} bytes required, limit {limit}")]
    BufferLimitExceeded { required: usize, limit: usize },

    /// The device reported writing more bytes than the buffer holds.
    #[error("Device reported {written} bytes written into a {capacity} byte buffer")]
    InvalidSize { written: usize, capacity: usize },

    /// The device reported success with an empty image.
    #[error("Device returned an empty image")]
    EmptyImage,

    /// The capture task panicked before producing a result.
    #[error("Capture task panicked")]
    WorkerPanicked,
}

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl CaptureError {
    /// Compact, stable label used in round reports
    pub fn label(&self) -> String {
        match self {
            CaptureError::NotConnected => "not_connected".to_string(),
            CaptureError::DeviceError(e) => format!("device_error:{}", e.code),
            CaptureError::BufferLimitExceeded { .. } => "buffer_limit_exceeded".to_string(),
            CaptureError::InvalidSize { .. } => "invalid_size".to_string(),
            CaptureError::EmptyImage => "empty_image".to_string(),
            CaptureError::WorkerPanicked => "worker_panicked".to_string(),
        }
    }
}
