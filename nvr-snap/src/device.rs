// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Device client boundary
//!
//! [`DeviceClient`] is the seam to the vendor device-control library. The
//! library is initialized once per process through a [`DeviceRuntime`],
//! which the application entry point creates and hands to every
//! [`Session`](crate::session::Session) as a shared capability.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};

use crate::error::SdkError;
use crate::protocol::*;

/// Device client trait
///
/// Implementations must allow concurrent calls on one handle from several
/// threads; the fan-out orchestrator relies on it unless it is configured
/// for serialized dispatch.
pub trait DeviceClient: Send + Sync {
    /// Process-wide library initialization
    fn init(&self, config: &RuntimeConfig) -> Result<(), SdkError>;

    /// Process-wide library teardown
    fn cleanup(&self);

    /// Log in to a device
    fn connect(&self, params: &LoginParams) -> Result<DeviceHandle, SdkError>;

    /// Log out a handle
    fn disconnect(&self, handle: DeviceHandle) -> Result<(), SdkError>;

    /// Read the IP channel configuration table
    fn query_channel_config(&self, handle: DeviceHandle) -> Result<ChannelConfig, SdkError>;

    /// Ask the encoder of `channel` to emit a key frame on `stream`
    fn force_key_frame(
        &self,
        handle: DeviceHandle,
        channel: u32,
        stream: StreamType,
    ) -> Result<(), SdkError>;

    /// Capture a JPEG still into `buf`, using at most `buf.len()` bytes
    fn capture_still(
        &self,
        handle: DeviceHandle,
        channel: u32,
        params: &JpegParams,
        buf: &mut [u8],
    ) -> Result<StillStatus, SdkError>;
}

/// Runtime configuration applied at library initialization
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Connect timeout per attempt
    pub connect_timeout: Duration,
    /// Connect attempts per login
    pub connect_attempts: u32,
    /// Interval between automatic reconnects
    pub reconnect_interval: Duration,
    /// Let the library reconnect lost sessions on its own
    pub auto_reconnect: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            connect_attempts: 1,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            auto_reconnect: true,
        }
    }
}

/// Process-scoped device library runtime
///
/// Initialization is idempotent and cleanup runs at most once per
/// successful initialization, on [`shutdown`](Self::shutdown) or drop.
pub struct DeviceRuntime {
    client: Arc<dyn DeviceClient>,
    config: RuntimeConfig,
    initialized: Mutex<bool>,
}

impl DeviceRuntime {
    /// Create an uninitialized runtime
    pub fn new(client: Arc<dyn DeviceClient>, config: RuntimeConfig) -> Self {
        Self {
            client,
            config,
            initialized: Mutex::new(false),
        }
    }

    /// Create and initialize a runtime in one step
    pub fn init(
        client: Arc<dyn DeviceClient>,
        config: RuntimeConfig,
    ) -> Result<Arc<Self>, SdkError> {
        let runtime = Self::new(client, config);
        runtime.start()?;
        Ok(Arc::new(runtime))
    }

    /// Initialize the device library if not already done
    pub fn start(&self) -> Result<(), SdkError> {
        let mut initialized = self.initialized.lock().unwrap_or_else(|e| e.into_inner());
        if *initialized {
            return Ok(());
        }

        match self.client.init(&self.config) {
            Ok(()) => {
                *initialized = true;
                info!(
                    "Device runtime initialized (connect timeout {:?}, reconnect every {:?})",
                    self.config.connect_timeout, self.config.reconnect_interval
                );
                Ok(())
            }
            Err(e) => {
                error!("Device runtime init failed: {e}");
                Err(e)
            }
        }
    }

    /// Tear down the device library
    pub fn shutdown(&self) {
        let mut initialized = self.initialized.lock().unwrap_or_else(|e| e.into_inner());
        if *initialized {
            self.client.cleanup();
            *initialized = false;
            info!("Device runtime cleaned up");
        }
    }

    /// Check if the library is initialized
    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the device client
    pub fn client(&self) -> &dyn DeviceClient {
        self.client.as_ref()
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Simulated NVR for environments without the vendor library
pub mod stub {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::thread;

    use crate::error::SdkErrorKind;

    /// Vendor error codes reported by the stub
    pub const ERR_PASSWORD: u32 = 1;
    pub const ERR_NOT_LOGGED_IN: u32 = 3;
    pub const ERR_CHANNEL: u32 = 4;
    pub const ERR_NETWORK_CONNECT: u32 = 7;
    pub const ERR_NOT_INITIALIZED: u32 = 12;
    pub const ERR_KEY_FRAME: u32 = 23;

    /// How a channel answers capture requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ChannelBehavior {
        /// Produce an image of `size` bytes; smaller buffers are rejected
        Image { size: usize },
        /// Always fail with the given error
        Fail(SdkError),
        /// Always report the buffer as too small
        AlwaysTooSmall { hint: Option<usize> },
    }

    /// Stub device configuration
    #[derive(Debug, Clone)]
    pub struct StubConfig {
        /// IP channel slot table
        pub slots: Vec<ChannelSlot>,
        /// First logical channel number
        pub start_channel: u32,
        /// Accepted credentials
        pub credentials: Credentials,
        /// Default image size for channels without an explicit behavior
        pub image_size: usize,
        /// Include the required size in buffer-too-small responses
        pub size_hint: bool,
        /// Reject key frame requests
        pub reject_key_frames: bool,
        /// Fail library initialization
        pub init_fails: bool,
        /// Refuse all connections
        pub unreachable: bool,
        /// Simulated network latency per capture attempt
        pub capture_delay: Duration,
    }

    impl Default for StubConfig {
        fn default() -> Self {
            Self {
                slots: vec![ChannelSlot::default(); MAX_IP_CHANNELS],
                start_channel: 33,
                credentials: Credentials::new("admin", "admin"),
                image_size: 256 * 1024,
                size_hint: true,
                reject_key_frames: false,
                init_fails: false,
                unreachable: false,
                capture_delay: Duration::ZERO,
            }
        }
    }

    impl StubConfig {
        /// Enable the first `count` slots
        pub fn with_enabled_slots(count: usize) -> Self {
            let mut config = Self::default();
            for slot in config.slots.iter_mut().take(count) {
                slot.enabled = true;
            }
            config
        }
    }

    /// Simulated NVR
    pub struct StubDevice {
        config: StubConfig,
        behaviors: Mutex<HashMap<u32, ChannelBehavior>>,
        frames: Mutex<HashMap<u32, u64>>,
        live: Mutex<HashSet<DeviceHandle>>,
        initialized: Mutex<bool>,
        next_handle: AtomicI64,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        capture_calls: AtomicUsize,
        key_frames: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl StubDevice {
        pub fn new(config: StubConfig) -> Self {
            Self {
                config,
                behaviors: Mutex::new(HashMap::new()),
                frames: Mutex::new(HashMap::new()),
                live: Mutex::new(HashSet::new()),
                initialized: Mutex::new(false),
                next_handle: AtomicI64::new(0),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                capture_calls: AtomicUsize::new(0),
                key_frames: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        /// Override the capture behavior of one channel
        pub fn set_behavior(&self, channel: u32, behavior: ChannelBehavior) {
            lock(&self.behaviors).insert(channel, behavior);
        }

        /// Number of successful connects
        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// Number of successful disconnects
        pub fn disconnects(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }

        /// Number of handles currently logged in
        pub fn live_handles(&self) -> usize {
            lock(&self.live).len()
        }

        /// Number of capture attempts, including buffer-too-small ones
        pub fn capture_calls(&self) -> usize {
            self.capture_calls.load(Ordering::SeqCst)
        }

        /// Number of accepted key frame requests
        pub fn key_frames(&self) -> usize {
            self.key_frames.load(Ordering::SeqCst)
        }

        /// Highest number of captures observed in flight at once
        pub fn peak_concurrency(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        /// Drop every live handle, as a device reboot would
        pub fn expire_sessions(&self) {
            lock(&self.live).clear();
        }

        fn check_handle(&self, handle: DeviceHandle) -> Result<(), SdkError> {
            if lock(&self.live).contains(&handle) {
                Ok(())
            } else {
                Err(SdkError::new(ERR_NOT_LOGGED_IN, SdkErrorKind::NotLoggedIn))
            }
        }

        fn behavior(&self, channel: u32) -> Result<ChannelBehavior, SdkError> {
            if let Some(behavior) = lock(&self.behaviors).get(&channel) {
                return Ok(*behavior);
            }
            let index = channel
                .checked_sub(self.config.start_channel)
                .map(|i| i as usize)
                .filter(|&i| i < self.config.slots.len() && self.config.slots[i].enabled);
            match index {
                Some(_) => Ok(ChannelBehavior::Image {
                    size: self.config.image_size,
                }),
                None => Err(SdkError::new(ERR_CHANNEL, SdkErrorKind::ChannelOffline)),
            }
        }

        fn next_frame(&self, channel: u32) -> u64 {
            let mut frames = lock(&self.frames);
            let frame = frames.entry(channel).or_insert(0);
            *frame += 1;
            *frame
        }

        fn render(&self, channel: u32, size: usize, buf: &mut [u8]) {
            let frame = self.next_frame(channel);
            let image = &mut buf[..size];
            let seed = (channel as u64).wrapping_mul(31).wrapping_add(frame);
            for (i, byte) in image.iter_mut().enumerate() {
                *byte = (seed.wrapping_add(i as u64) % 251) as u8;
            }
            // JPEG SOI / EOI markers
            if size >= 4 {
                image[0] = 0xFF;
                image[1] = 0xD8;
                image[size - 2] = 0xFF;
                image[size - 1] = 0xD9;
            }
        }

        fn answer(&self, channel: u32, buf: &mut [u8]) -> Result<StillStatus, SdkError> {
            match self.behavior(channel)? {
                ChannelBehavior::Fail(e) => Err(e),
                ChannelBehavior::AlwaysTooSmall { hint } => {
                    Ok(StillStatus::BufferTooSmall { required: hint })
                }
                ChannelBehavior::Image { size } => {
                    if buf.len() < size {
                        let required = self.config.size_hint.then_some(size);
                        return Ok(StillStatus::BufferTooSmall { required });
                    }
                    self.render(channel, size, buf);
                    Ok(StillStatus::Written(size))
                }
            }
        }
    }

    impl DeviceClient for StubDevice {
        fn init(&self, _config: &RuntimeConfig) -> Result<(), SdkError> {
            if self.config.init_fails {
                return Err(SdkError::new(ERR_NOT_INITIALIZED, SdkErrorKind::Other));
            }
            *lock(&self.initialized) = true;
            Ok(())
        }

        fn cleanup(&self) {
            *lock(&self.initialized) = false;
            lock(&self.live).clear();
        }

        fn connect(&self, params: &LoginParams) -> Result<DeviceHandle, SdkError> {
            if !*lock(&self.initialized) {
                return Err(SdkError::new(ERR_NOT_INITIALIZED, SdkErrorKind::Other));
            }
            if self.config.unreachable {
                return Err(SdkError::new(ERR_NETWORK_CONNECT, SdkErrorKind::Unreachable));
            }
            if params.credentials != self.config.credentials {
                return Err(SdkError::new(ERR_PASSWORD, SdkErrorKind::BadCredentials));
            }

            let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
            lock(&self.live).insert(handle);
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(handle)
        }

        fn disconnect(&self, handle: DeviceHandle) -> Result<(), SdkError> {
            if lock(&self.live).remove(&handle) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(SdkError::new(ERR_NOT_LOGGED_IN, SdkErrorKind::NotLoggedIn))
            }
        }

        fn query_channel_config(&self, handle: DeviceHandle) -> Result<ChannelConfig, SdkError> {
            self.check_handle(handle)?;
            Ok(ChannelConfig {
                slots: self.config.slots.clone(),
                start_channel: self.config.start_channel,
            })
        }

        fn force_key_frame(
            &self,
            handle: DeviceHandle,
            channel: u32,
            _stream: StreamType,
        ) -> Result<(), SdkError> {
            self.check_handle(handle)?;
            if self.config.reject_key_frames {
                return Err(SdkError::new(ERR_KEY_FRAME, SdkErrorKind::Other));
            }
            self.behavior(channel)?;
            self.key_frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn capture_still(
            &self,
            handle: DeviceHandle,
            channel: u32,
            _params: &JpegParams,
            buf: &mut [u8],
        ) -> Result<StillStatus, SdkError> {
            self.check_handle(handle)?;
            self.capture_calls.fetch_add(1, Ordering::SeqCst);

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.config.capture_delay.is_zero() {
                thread::sleep(self.config.capture_delay);
            }
            let status = self.answer(channel, buf);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            status
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}
