// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! nvr-snap
//!
//! This crate captures JPEG still images from every enabled channel of a
//! network video recorder.
//!
//! # Overview
//!
//! A single authenticated session is shared by all capture tasks. It provides:
//!
//! - **Session**: Login, re-login and logout against one device
//! - **Channel Directory**: Maps the IP channel slot table to channel ids
//! - **Still Capture**: Grows the image buffer until the device accepts it
//! - **Fan-out**: Captures all channels at once and collects every outcome
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Snapshot Agent                          │
//! │  - Rounds, re-login on total failure                        │
//! │  - Snapshot sink (chn_<id>.jpg)                             │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Fan-out                               │
//! │  - One task per channel, one buffer per task                │
//! │  - Per-channel outcome, failures isolated                   │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Still Capture                            │
//! │  - Buffer floor, growth and ceiling                         │
//! │  - Optional key frame request                               │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Session / Device Runtime                     │
//! │  - Process-wide device library state                        │
//! │  - Device handle lifetime                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nvr_snap::{capture_all, list_enabled_channels, DeviceRuntime, RuntimeConfig, Session};
//!
//! let runtime = DeviceRuntime::init(client, RuntimeConfig::default())?;
//! let mut session = Session::new(runtime);
//! session.login("192.168.1.64", 8000, "admin", "password")?;
//!
//! let channels = list_enabled_channels(&session)?;
//! for (id, outcome) in capture_all(&session, &channels) {
//!     // ...
//! }
//! ```
//!
//! # Modules
//!
//! - [`agent`]: Capture rounds and snapshot persistence
//! - [`buffer`]: Capture buffers and buffer pool
//! - [`capture`]: Still capture protocol
//! - [`channels`]: Channel directory
//! - [`device`]: Device library seam and process runtime
//! - [`fanout`]: Fan-out orchestrator
//! - [`protocol`]: Shared device definitions
//! - [`session`]: Device session
//! - [`sink`]: Snapshot persistence

pub mod agent;
pub mod buffer;
pub mod capture;
pub mod channels;
pub mod device;
pub mod error;
pub mod fanout;
pub mod protocol;
pub mod session;
pub mod sink;

pub use agent::{AgentConfig, RoundReport, SnapAgent};
pub use buffer::{BufferPool, CaptureBuffer, PoolConfig};
pub use capture::{CaptureConfig, StillCapture};
pub use channels::{list_enabled_channels, Channel};
pub use device::{DeviceClient, DeviceRuntime, RuntimeConfig};
pub use error::{AgentError, CaptureError, DiscoveryError, IFrameError, SdkError, SessionError};
pub use fanout::{capture_all, CaptureOutcome, Dispatch, FanOut, FanOutConfig};
pub use protocol::*;
pub use session::Session;
pub use sink::{DirectorySink, MemorySink, SnapshotSink};
